//! UDP transport.
//!
//! One socket per slot, connected to the server. Every datagram starts with a
//! kind byte: control datagrams carry the handshake (`Connect`, `Accept`,
//! `Close`, `KeepAlive`), data datagrams carry one encoded [`Packet`].
//!
//! All socket operations are `try_*`: `poll` never waits. Outgoing datagrams
//! are queued and flushed whenever the socket is writable, so a send never
//! fails just because the reactor has not reported readiness yet. Host names
//! are resolved on the runtime; the link opens on a later `poll`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use engine_shared::{
    error::{ClientError, ClientResult},
    net::{ClientSlot, Packet, Transport, TransportEvent, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE},
};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DATAGRAM_CONTROL: u8 = 0;
pub const DATAGRAM_DATA: u8 = 1;

/// Largest datagram the transport reads.
pub const MAX_DATAGRAM_SIZE: usize = 1 + PACKET_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Handshake and liveness messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    Connect = 1,
    Accept = 2,
    Close = 3,
    KeepAlive = 4,
}

impl Control {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Control::Connect),
            2 => Some(Control::Accept),
            3 => Some(Control::Close),
            4 => Some(Control::KeepAlive),
            _ => None,
        }
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Control code plus an optional reason (used by `Close`).
    Control(Control, String),
    Data(Packet),
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Datagram::Control(code, reason) => {
                out.put_u8(DATAGRAM_CONTROL);
                out.put_u8(*code as u8);
                out.extend_from_slice(reason.as_bytes());
            }
            Datagram::Data(packet) => {
                out.put_u8(DATAGRAM_DATA);
                out.extend_from_slice(&packet.encode());
            }
        }
        out.freeze()
    }

    pub fn decode(mut data: Bytes) -> ClientResult<Self> {
        if !data.has_remaining() {
            return Err(ClientError::protocol("empty datagram"));
        }
        match data.get_u8() {
            DATAGRAM_CONTROL => {
                if !data.has_remaining() {
                    return Err(ClientError::protocol("control datagram without code"));
                }
                let raw = data.get_u8();
                let code = Control::from_u8(raw)
                    .ok_or_else(|| ClientError::protocol(format!("unknown control code {raw}")))?;
                let reason = String::from_utf8_lossy(&data).into_owned();
                Ok(Datagram::Control(code, reason))
            }
            DATAGRAM_DATA => Ok(Datagram::Data(Packet::decode(data)?)),
            kind => Err(ClientError::protocol(format!("unknown datagram kind {kind}"))),
        }
    }
}

/// Retry and liveness policy.
#[derive(Debug, Clone, Copy)]
pub struct UdpTransportConfig {
    /// Interval between `Connect` attempts.
    pub connect_retry: Duration,
    /// `Connect` attempts before giving up.
    pub connect_attempts: u32,
    /// Idle time after which a `KeepAlive` is sent.
    pub keepalive: Duration,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_millis(500),
            connect_attempts: 10,
            keepalive: Duration::from_secs(1),
        }
    }
}

struct Link {
    socket: UdpSocket,
    peer: SocketAddr,
    accepted: bool,
    attempts: u32,
    last_attempt: Option<Instant>,
    last_send: Instant,
    outbox: VecDeque<Bytes>,
}

impl Link {
    fn queue(&mut self, datagram: Bytes) {
        self.outbox.push_back(datagram);
    }

    /// Sends queued datagrams until the socket would block.
    fn flush(&mut self, now: Instant) -> io::Result<()> {
        while let Some(datagram) = self.outbox.front() {
            match self.socket.try_send(datagram) {
                Ok(_) => {
                    self.outbox.pop_front();
                    self.last_send = now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// [`Transport`] over one tokio UDP socket per slot.
pub struct UdpTransport {
    config: UdpTransportConfig,
    links: HashMap<ClientSlot, Link>,
    /// Host name lookups in flight.
    resolving: HashMap<ClientSlot, oneshot::Receiver<io::Result<SocketAddr>>>,
    events: VecDeque<TransportEvent>,
    recv_buf: Vec<u8>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(UdpTransportConfig::default())
    }
}

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> Self {
        Self {
            config,
            links: HashMap::new(),
            resolving: HashMap::new(),
            events: VecDeque::new(),
            recv_buf: vec![0; MAX_DATAGRAM_SIZE],
        }
    }

    /// Local address of the socket used by `slot`.
    pub fn local_addr(&self, slot: ClientSlot) -> Option<SocketAddr> {
        self.links.get(&slot)?.socket.local_addr().ok()
    }

    pub fn is_accepted(&self, slot: ClientSlot) -> bool {
        self.links.get(&slot).is_some_and(|l| l.accepted)
    }

    /// Looks `host` up without blocking; IPv4 answers are preferred.
    fn spawn_lookup(
        handle: &tokio::runtime::Handle,
        host: String,
    ) -> oneshot::Receiver<io::Result<SocketAddr>> {
        let (tx, rx) = oneshot::channel();
        handle.spawn(async move {
            let result = tokio::net::lookup_host(host.as_str()).await.and_then(|addrs| {
                let addrs: Vec<SocketAddr> = addrs.collect();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or(addrs.first())
                    .copied()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"))
            });
            let _ = tx.send(result);
        });
        rx
    }

    fn open_link(&mut self, slot: ClientSlot, peer: SocketAddr) -> ClientResult<()> {
        let socket = Self::open_socket(peer)
            .map_err(|e| ClientError::transport(format!("open socket to {peer}: {e}")))?;
        info!(slot = %slot, peer = %peer, "Opening link");
        self.links.insert(
            slot,
            Link {
                socket,
                peer,
                accepted: false,
                attempts: 0,
                last_attempt: None,
                last_send: Instant::now(),
                outbox: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Opens links for finished lookups; failures become close reasons.
    fn finish_lookups(&mut self) {
        let mut done = Vec::new();
        for (slot, rx) in &mut self.resolving {
            match rx.try_recv() {
                Ok(result) => done.push((*slot, result)),
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => done.push((
                    *slot,
                    Err(io::Error::new(io::ErrorKind::Interrupted, "lookup cancelled")),
                )),
            }
        }
        for (slot, result) in done {
            self.resolving.remove(&slot);
            let opened = result
                .map_err(|e| ClientError::transport(format!("resolve: {e}")))
                .and_then(|peer| self.open_link(slot, peer));
            if let Err(err) = opened {
                warn!(slot = %slot, error = %err, "Link failed");
                self.events.push_back(TransportEvent::Closed(slot, err.to_string()));
            }
        }
    }

    fn open_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = std::net::UdpSocket::bind(bind)?;
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }

    /// Receives, retries and keeps `slot` alive. Returns a close reason if
    /// the link must be dropped.
    fn service(&mut self, slot: ClientSlot, now: Instant) -> Option<String> {
        let config = self.config;
        let Self {
            links,
            events,
            recv_buf,
            ..
        } = self;
        let link = links.get_mut(&slot)?;

        loop {
            match link.socket.try_recv(&mut recv_buf[..]) {
                Ok(n) => {
                    let datagram = Bytes::copy_from_slice(&recv_buf[..n]);
                    match Datagram::decode(datagram) {
                        Ok(Datagram::Control(Control::Accept, _)) => {
                            if !link.accepted {
                                link.accepted = true;
                                info!(slot = %slot, peer = %link.peer, "Connection accepted");
                                events.push_back(TransportEvent::Connected(slot));
                            }
                        }
                        Ok(Datagram::Control(Control::Close, reason)) => {
                            let reason = if reason.is_empty() {
                                "server closed the connection".to_string()
                            } else {
                                reason
                            };
                            return Some(reason);
                        }
                        Ok(Datagram::Control(_, _)) => {}
                        Ok(Datagram::Data(packet)) if link.accepted => {
                            events.push_back(TransportEvent::Packet(slot, packet));
                        }
                        Ok(Datagram::Data(_)) => {
                            debug!(slot = %slot, "Data before accept; dropped");
                        }
                        Err(err) => {
                            debug!(slot = %slot, error = %err, "Bad datagram; dropped");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Some(format!("receive failed: {e}")),
            }
        }

        if !link.accepted {
            let due = link
                .last_attempt
                .map_or(true, |at| now.saturating_duration_since(at) >= config.connect_retry);
            if due {
                if link.attempts >= config.connect_attempts {
                    return Some("no response from server".to_string());
                }
                link.attempts += 1;
                link.last_attempt = Some(now);
                debug!(slot = %slot, attempt = link.attempts, "Sending connect");
                link.queue(Datagram::Control(Control::Connect, String::new()).encode());
            }
        } else if link.outbox.is_empty()
            && now.saturating_duration_since(link.last_send) >= config.keepalive
        {
            link.queue(Datagram::Control(Control::KeepAlive, String::new()).encode());
        }

        match link.flush(now) {
            Ok(()) => None,
            Err(e) => Some(format!("send failed: {e}")),
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self, slot: ClientSlot, addr: &str) -> ClientResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ClientError::transport("udp transport needs a tokio runtime"))?;
        let had_link = self.links.remove(&slot).is_some();
        if self.resolving.remove(&slot).is_some() || had_link {
            debug!(slot = %slot, "Replacing existing link");
        }
        if let Ok(peer) = addr.parse::<SocketAddr>() {
            return self.open_link(slot, peer);
        }
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                debug!(slot = %slot, addr, "Resolving");
                let rx = Self::spawn_lookup(&handle, addr.to_string());
                self.resolving.insert(slot, rx);
                Ok(())
            }
            _ => Err(ClientError::transport(format!("{addr} is not host:port"))),
        }
    }

    fn disconnect(&mut self, slot: ClientSlot, reason: &str) {
        self.resolving.remove(&slot);
        let Some(mut link) = self.links.remove(&slot) else {
            return;
        };
        link.outbox.clear();
        link.queue(Datagram::Control(Control::Close, reason.to_string()).encode());
        if let Err(e) = link.flush(Instant::now()) {
            debug!(slot = %slot, error = %e, "Close not delivered");
        }
        // Drop any event that was queued for the old link.
        self.events.retain(|event| match event {
            TransportEvent::Connected(s) | TransportEvent::Packet(s, _) | TransportEvent::Closed(s, _) => {
                *s != slot
            }
        });
    }

    fn send(&mut self, slot: ClientSlot, packet: &Packet) -> ClientResult<()> {
        let link = self
            .links
            .get_mut(&slot)
            .filter(|l| l.accepted)
            .ok_or_else(|| ClientError::transport(format!("{slot} link is not connected")))?;
        link.queue(Datagram::Data(packet.clone()).encode());
        link.flush(Instant::now())
            .map_err(|e| ClientError::transport(format!("send on {slot} link: {e}")))
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if !self.resolving.is_empty() {
            self.finish_lookups();
        }
        if self.events.is_empty() {
            let now = Instant::now();
            for slot in ClientSlot::ALL {
                if let Some(reason) = self.service(slot, now) {
                    warn!(slot = %slot, reason = %reason, "Link closed");
                    self.links.remove(&slot);
                    self.events.push_back(TransportEvent::Closed(slot, reason));
                }
            }
        }
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::net::MsgFlags;

    #[test]
    fn datagrams_roundtrip() {
        let close = Datagram::Control(Control::Close, "kicked".into());
        assert_eq!(Datagram::decode(close.encode()).unwrap(), close);

        let data = Datagram::Data(Packet::new(
            false,
            9,
            MsgFlags::VITAL,
            Bytes::from_static(b"payload"),
        ));
        assert_eq!(Datagram::decode(data.encode()).unwrap(), data);
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(Datagram::decode(Bytes::from_static(&[7, 1])).is_err());
        assert!(Datagram::decode(Bytes::from_static(&[DATAGRAM_CONTROL, 99])).is_err());
        assert!(Datagram::decode(Bytes::new()).is_err());
    }

    #[test]
    fn connect_outside_runtime_fails_cleanly() {
        let mut transport = UdpTransport::default();
        let err = transport.connect(ClientSlot::Main, "127.0.0.1:8303").unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn host_names_resolve_in_the_background() {
        let mut transport = UdpTransport::default();
        transport.connect(ClientSlot::Main, "localhost:8303").unwrap();
        assert!(transport.local_addr(ClientSlot::Main).is_none());
        assert!(transport.connect(ClientSlot::Dummy, "localhost").is_err());
        assert!(transport.connect(ClientSlot::Dummy, ":8303").is_err());

        transport.disconnect(ClientSlot::Main, "changed my mind");
        assert!(transport.resolving.is_empty());
    }

    #[test]
    fn send_without_link_fails() {
        let mut transport = UdpTransport::default();
        let packet = Packet::new(true, 1, MsgFlags::empty(), Bytes::new());
        assert!(transport.send(ClientSlot::Dummy, &packet).is_err());
        assert!(transport.poll().is_none());
    }
}
