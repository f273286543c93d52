//! Test harness for the client core.
//!
//! - [`LoopbackServer`] / [`LoopbackTransport`]: an in-memory transport the
//!   test scripts from the server side.
//! - [`RecordingHooks`]: game hooks that log every callback.
//! - [`MemoryMapStorage`]: map storage without a filesystem.
//! - [`snapshot_data`]: encodes items the way the server would.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use engine_client::{
    hooks::GameHooks, map::MapStorage, state::ClientState, GameClient,
};
use engine_shared::{
    config::{EngineConfig, SnapshotLimits},
    error::{ClientError, ClientResult},
    net::{
        ClientSlot, MapDescriptor, MsgFlags, NetMsg, Packet, ProtocolMessage, Transport,
        TransportEvent,
    },
    snapshot::{encode_items, SnapshotBuffer, StaticSizeTable},
};
use tracing::debug;

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

// ─── Transport ───

#[derive(Debug, Default)]
struct Wire {
    events: VecDeque<TransportEvent>,
    links: HashMap<ClientSlot, String>,
    sent: Vec<(ClientSlot, Packet)>,
    disconnects: Vec<(ClientSlot, String)>,
    refuse: HashSet<ClientSlot>,
}

/// Server side of the loopback: queues events for the client and inspects
/// what the client sent.
#[derive(Debug, Clone, Default)]
pub struct LoopbackServer {
    wire: Rc<RefCell<Wire>>,
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client half sharing this server's wire.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            wire: Rc::clone(&self.wire),
        }
    }

    /// Makes the next `connect` for `slot` fail.
    pub fn refuse(&self, slot: ClientSlot) {
        self.wire.borrow_mut().refuse.insert(slot);
    }

    pub fn is_linked(&self, slot: ClientSlot) -> bool {
        self.wire.borrow().links.contains_key(&slot)
    }

    pub fn linked_addr(&self, slot: ClientSlot) -> Option<String> {
        self.wire.borrow().links.get(&slot).cloned()
    }

    /// Completes the handshake for `slot`.
    pub fn accept(&self, slot: ClientSlot) {
        self.wire
            .borrow_mut()
            .events
            .push_back(TransportEvent::Connected(slot));
    }

    pub fn close(&self, slot: ClientSlot, reason: &str) {
        self.wire
            .borrow_mut()
            .events
            .push_back(TransportEvent::Closed(slot, reason.to_string()));
    }

    pub fn send_packet(&self, slot: ClientSlot, packet: Packet) {
        self.wire
            .borrow_mut()
            .events
            .push_back(TransportEvent::Packet(slot, packet));
    }

    /// Sends a system message.
    pub fn send(&self, slot: ClientSlot, msg: &NetMsg) {
        match msg.to_packet(MsgFlags::VITAL) {
            Ok(packet) => self.send_packet(slot, packet),
            Err(err) => panic!("cannot pack {msg:?}: {err}"),
        }
    }

    /// Sends a game-layer message.
    pub fn send_game(&self, slot: ClientSlot, msg_id: u16, payload: &[u8]) {
        self.send_packet(
            slot,
            Packet::new(false, msg_id, MsgFlags::VITAL, Bytes::copy_from_slice(payload)),
        );
    }

    /// Every packet the client sent, in order.
    pub fn sent_packets(&self) -> Vec<(ClientSlot, Packet)> {
        self.wire.borrow().sent.clone()
    }

    /// System messages the client sent on `slot`.
    pub fn sent(&self, slot: ClientSlot) -> Vec<NetMsg> {
        self.wire
            .borrow()
            .sent
            .iter()
            .filter(|(s, p)| *s == slot && p.system)
            .filter_map(|(_, p)| NetMsg::from_packet(p).ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.wire.borrow_mut().sent.clear();
    }

    pub fn disconnects(&self) -> Vec<(ClientSlot, String)> {
        self.wire.borrow().disconnects.clone()
    }
}

/// Client half of the loopback.
#[derive(Debug)]
pub struct LoopbackTransport {
    wire: Rc<RefCell<Wire>>,
}

impl Transport for LoopbackTransport {
    fn connect(&mut self, slot: ClientSlot, addr: &str) -> ClientResult<()> {
        let mut wire = self.wire.borrow_mut();
        if wire.refuse.remove(&slot) {
            return Err(ClientError::transport(format!("{addr} refused")));
        }
        debug!(slot = %slot, addr, "Loopback link opened");
        wire.links.insert(slot, addr.to_string());
        Ok(())
    }

    fn disconnect(&mut self, slot: ClientSlot, reason: &str) {
        let mut wire = self.wire.borrow_mut();
        if wire.links.remove(&slot).is_some() {
            wire.disconnects.push((slot, reason.to_string()));
        }
        wire.events.retain(|event| match event {
            TransportEvent::Connected(s)
            | TransportEvent::Packet(s, _)
            | TransportEvent::Closed(s, _) => *s != slot,
        });
    }

    fn send(&mut self, slot: ClientSlot, packet: &Packet) -> ClientResult<()> {
        let mut wire = self.wire.borrow_mut();
        if !wire.links.contains_key(&slot) {
            return Err(ClientError::transport(format!("{slot} link is down")));
        }
        wire.sent.push((slot, packet.clone()));
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.wire.borrow_mut().events.pop_front()
    }
}

// ─── Hooks ───

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    StateChange {
        slot: ClientSlot,
        new: ClientState,
        old: ClientState,
    },
    Connected(ClientSlot),
    EnterGame(ClientSlot),
    NewSnapshot(ClientSlot, i32),
    Message(ClientSlot, u16),
    DummySwap(ClientSlot),
    DummyDisconnect(String),
    RconLine(ClientSlot, String),
    Shutdown,
}

#[derive(Debug, Default)]
struct HookLog {
    events: Vec<HookEvent>,
    input: Option<Vec<i32>>,
}

/// Hooks that record every callback. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    log: Rc<RefCell<HookLog>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.log.borrow().events.clone()
    }

    pub fn clear(&self) {
        self.log.borrow_mut().events.clear();
    }

    /// State changes seen for `slot`, as `(old, new)` pairs.
    pub fn transitions(&self, slot: ClientSlot) -> Vec<(ClientState, ClientState)> {
        self.log
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                HookEvent::StateChange { slot: s, new, old } if *s == slot => Some((*old, *new)),
                _ => None,
            })
            .collect()
    }

    pub fn snapshots(&self, slot: ClientSlot) -> Vec<i32> {
        self.log
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                HookEvent::NewSnapshot(s, tick) if *s == slot => Some(*tick),
                _ => None,
            })
            .collect()
    }

    /// Input returned from `on_snap_input`.
    pub fn set_input(&self, input: Option<Vec<i32>>) {
        self.log.borrow_mut().input = input;
    }

    fn push(&self, event: HookEvent) {
        self.log.borrow_mut().events.push(event);
    }
}

impl GameHooks for RecordingHooks {
    fn on_state_change(&mut self, slot: ClientSlot, new: ClientState, old: ClientState) {
        self.push(HookEvent::StateChange { slot, new, old });
    }

    fn on_connected(&mut self, slot: ClientSlot) {
        self.push(HookEvent::Connected(slot));
    }

    fn on_enter_game(&mut self, slot: ClientSlot) {
        self.push(HookEvent::EnterGame(slot));
    }

    fn on_new_snapshot(&mut self, slot: ClientSlot, tick: i32) {
        self.push(HookEvent::NewSnapshot(slot, tick));
    }

    fn on_message(&mut self, slot: ClientSlot, packet: &Packet) {
        self.push(HookEvent::Message(slot, packet.msg_id));
    }

    fn on_snap_input(&mut self, _slot: ClientSlot, _force: bool) -> Option<Vec<i32>> {
        self.log.borrow().input.clone()
    }

    fn on_dummy_swap(&mut self, active: ClientSlot) {
        self.push(HookEvent::DummySwap(active));
    }

    fn on_dummy_disconnect(&mut self, reason: &str) {
        self.push(HookEvent::DummyDisconnect(reason.to_string()));
    }

    fn on_rcon_line(&mut self, slot: ClientSlot, line: &str) {
        self.push(HookEvent::RconLine(slot, line.to_string()));
    }

    fn on_shutdown(&mut self) {
        self.push(HookEvent::Shutdown);
    }
}

// ─── Maps ───

#[derive(Debug, Default)]
struct MapShelf {
    maps: HashMap<String, Vec<u8>>,
    fail_store: bool,
}

/// Maps kept in memory, keyed by SHA-256. Clones share the shelf.
#[derive(Debug, Clone, Default)]
pub struct MemoryMapStorage {
    shelf: Rc<RefCell<MapShelf>>,
}

impl MemoryMapStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, map: &MapDescriptor, data: &[u8]) {
        self.shelf
            .borrow_mut()
            .maps
            .insert(map.sha256.clone(), data.to_vec());
    }

    pub fn contains(&self, map: &MapDescriptor) -> bool {
        self.shelf.borrow().maps.contains_key(&map.sha256)
    }

    /// Makes every `store` fail with a resource error.
    pub fn fail_store(&self, fail: bool) {
        self.shelf.borrow_mut().fail_store = fail;
    }

    fn path(map: &MapDescriptor) -> PathBuf {
        PathBuf::from(format!("memory/{}.map", map.name))
    }
}

impl MapStorage for MemoryMapStorage {
    fn find(&self, map: &MapDescriptor) -> Option<PathBuf> {
        self.contains(map).then(|| Self::path(map))
    }

    fn store(&mut self, map: &MapDescriptor, data: &[u8]) -> ClientResult<PathBuf> {
        if self.shelf.borrow().fail_store {
            return Err(ClientError::resource(format!("no space for {}", map.name)));
        }
        self.insert(map, data);
        Ok(Self::path(map))
    }
}

// ─── Fixtures ───

/// Encodes `items` as a server snapshot payload.
pub fn snapshot_data(items: &[(u16, u16, &[u8])], statics: &StaticSizeTable) -> Vec<u8> {
    let limits = SnapshotLimits::default();
    let mut buffer = SnapshotBuffer::with_limits(limits);
    for (type_id, id, data) in items {
        match buffer.push_item(*type_id, *id, data.len(), &limits) {
            Ok(slot) => slot.copy_from_slice(data),
            Err(err) => panic!("bad fixture item ({type_id}, {id}): {err}"),
        }
    }
    let mut out = BytesMut::new();
    encode_items(&buffer, statics, &mut out);
    out.to_vec()
}

/// Client wired to a loopback server, recording hooks and in-memory maps.
pub struct Harness {
    pub client: GameClient,
    pub server: LoopbackServer,
    pub hooks: RecordingHooks,
    pub maps: MemoryMapStorage,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let server = LoopbackServer::new();
        let hooks = RecordingHooks::new();
        let maps = MemoryMapStorage::new();
        let now = Instant::now();
        let client = GameClient::new(
            config,
            Box::new(server.transport()),
            Box::new(hooks.clone()),
            now,
        )
        .with_map_storage(Box::new(maps.clone()));
        Self {
            client,
            server,
            hooks,
            maps,
            now,
        }
    }

    /// Advances local time by `ms` and runs one client frame.
    pub fn step(&mut self, ms: u64) {
        self.now += std::time::Duration::from_millis(ms);
        if let Err(err) = self.client.update(self.now) {
            panic!("update failed: {err}");
        }
    }

    /// Standard map the fake server announces.
    pub fn map() -> (MapDescriptor, Vec<u8>) {
        let data = b"tiles and entities".to_vec();
        let map = MapDescriptor {
            name: "ctf1".into(),
            sha256: engine_client::map::sha256_hex(&data),
            size: data.len() as u64,
        };
        (map, data)
    }

    /// Brings `slot` from Offline to Online using a locally stored map.
    pub fn bring_online(&mut self, slot: ClientSlot) {
        let (map, data) = Self::map();
        self.maps.insert(&map, &data);
        self.server.accept(slot);
        self.step(10);
        self.server.send(slot, &NetMsg::MapChange(map));
        self.server.send(slot, &NetMsg::ConReady);
        self.step(10);
        assert_eq!(self.client.state_of(slot), ClientState::Online);
    }

    /// Connects main and brings it Online.
    pub fn connect_online(&mut self) {
        if let Err(err) = self.client.connect("server:8303") {
            panic!("connect failed: {err}");
        }
        self.bring_online(ClientSlot::Main);
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
