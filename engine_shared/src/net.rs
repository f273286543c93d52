//! Networking primitives.
//!
//! - Client slots (`main`, `dummy`) that address one of the two sessions.
//! - Packet framing with a message-id tag and a flag set.
//! - System message types exchanged with the server.
//! - The non-blocking `Transport` seam the client polls once per frame.
//!
//! Serialization is explicit and versioned: a fixed binary header framed
//! with `bytes`, system payloads as JSON.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u8 = 7;

/// Game/network version string sent in the connect info.
pub const NET_VERSION: &str = "0.7 802f1be60a05665f";

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 9;

/// Largest payload accepted in a single packet.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Identifies one of the two concurrent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientSlot {
    #[default]
    Main,
    Dummy,
}

impl ClientSlot {
    pub const ALL: [ClientSlot; 2] = [ClientSlot::Main, ClientSlot::Dummy];

    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            ClientSlot::Main => ClientSlot::Dummy,
            ClientSlot::Dummy => ClientSlot::Main,
        }
    }

    pub fn is_dummy(self) -> bool {
        self == ClientSlot::Dummy
    }
}

impl fmt::Display for ClientSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientSlot::Main => write!(f, "main"),
            ClientSlot::Dummy => write!(f, "dummy"),
        }
    }
}

bitflags::bitflags! {
    /// Per-message send flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MsgFlags: u8 {
        /// Reliable, ordered delivery.
        const VITAL = 1 << 0;
        /// Flush the send queue right away.
        const FLUSH = 1 << 1;
        /// Never written to a demo.
        const NORECORD = 1 << 2;
        /// Written to the demo if one is being recorded.
        const RECORD = 1 << 3;
        /// Not transmitted (record only).
        const NOSEND = 1 << 4;
    }
}

/// System message ids.
pub mod msg_id {
    pub const INFO: u16 = 1;
    pub const MAP_CHANGE: u16 = 2;
    pub const MAP_DATA: u16 = 3;
    pub const SERVER_INFO: u16 = 4;
    pub const CON_READY: u16 = 5;
    pub const SNAP: u16 = 6;
    pub const SNAP_EMPTY: u16 = 7;
    pub const INPUT_TIMING: u16 = 8;
    pub const RCON_AUTH_STATUS: u16 = 9;
    pub const RCON_LINE: u16 = 10;
    pub const RCON_CMD_ADD: u16 = 11;
    pub const RCON_CMD_REM: u16 = 12;
    pub const READY: u16 = 13;
    pub const ENTER_GAME: u16 = 14;
    pub const INPUT: u16 = 15;
    pub const RCON_CMD: u16 = 16;
    pub const RCON_AUTH: u16 = 17;
    pub const REQUEST_MAP_DATA: u16 = 18;
    pub const PING: u16 = 19;
    pub const PING_REPLY: u16 = 20;
}

/// A framed application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// System (engine) message rather than a game-layer message.
    pub system: bool,
    pub msg_id: u16,
    pub flags: MsgFlags,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(system: bool, msg_id: u16, flags: MsgFlags, payload: Bytes) -> Self {
        Self {
            system,
            msg_id,
            flags,
            payload,
        }
    }

    /// Encodes header and payload into a single buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(u8::from(self.system));
        buf.put_u16(self.msg_id);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes one packet; trailing bytes are rejected.
    pub fn decode(mut data: Bytes) -> ClientResult<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ClientError::protocol(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }
        let version = data.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ClientError::protocol(format!(
                "version mismatch: expected {PROTOCOL_VERSION}, got {version}"
            )));
        }
        let system = data.get_u8() != 0;
        let msg_id = data.get_u16();
        let flags = MsgFlags::from_bits_truncate(data.get_u8());
        let len = data.get_u32() as usize;
        if len > MAX_PAYLOAD_SIZE || len != data.len() {
            return Err(ClientError::protocol(format!(
                "payload length {len} does not match {} remaining bytes",
                data.len()
            )));
        }
        Ok(Self {
            system,
            msg_id,
            flags,
            payload: data,
        })
    }
}

/// A message that knows its id and how to pack itself.
pub trait ProtocolMessage {
    fn msg_id(&self) -> u16;

    /// Engine-level message rather than a game-layer one.
    fn is_system(&self) -> bool {
        false
    }

    fn pack(&self, out: &mut BytesMut) -> ClientResult<()>;

    /// Packs into a framed packet.
    fn to_packet(&self, flags: MsgFlags) -> ClientResult<Packet> {
        let mut out = BytesMut::new();
        self.pack(&mut out)?;
        Ok(Packet::new(self.is_system(), self.msg_id(), flags, out.freeze()))
    }
}

/// Read-only snapshot of server metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    pub name: String,
    pub version: String,
    pub game_type: String,
    pub map_name: String,
    pub map_sha256: String,
    pub map_size: u64,
    pub num_players: u32,
    pub max_players: u32,
    pub num_clients: u32,
    pub max_clients: u32,
    pub passworded: bool,
}

/// Map announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDescriptor {
    pub name: String,
    /// Hex-encoded SHA-256 of the map file.
    pub sha256: String,
    pub size: u64,
}

/// System messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetMsg {
    // ─── Connection ───
    /// Client -> server: version, password and reconnect token.
    Info {
        version: String,
        password: Option<String>,
        timeout_code: String,
    },
    /// Server -> client: load this map.
    MapChange(MapDescriptor),
    /// Client -> server: send map chunk `chunk`.
    RequestMapData { chunk: u32 },
    /// Server -> client: one map chunk.
    MapData {
        chunk: u32,
        last: bool,
        data: Vec<u8>,
    },
    /// Client -> server: map is loaded.
    Ready,
    /// Server -> client: the client may enter the game.
    ConReady,
    /// Client -> server: enter the game.
    EnterGame,
    /// Server -> client: metadata refresh.
    ServerInfo(ServerInfo),

    // ─── Gameplay ───
    /// Server -> client: encoded snapshot items for one tick.
    Snap { tick: i32, data: Vec<u8> },
    /// Server -> client: no items this tick.
    SnapEmpty { tick: i32 },
    /// Client -> server: input for `pred_tick`.
    Input {
        ack_tick: i32,
        pred_tick: i32,
        data: Vec<i32>,
    },
    /// Server -> client: how early the input for `input_pred_tick` arrived.
    InputTiming {
        input_pred_tick: i32,
        time_left_ms: i32,
    },

    // ─── Remote console ───
    RconAuth { name: String, password: String },
    RconAuthStatus { authed: bool, cmdlist: bool },
    RconLine { line: String },
    RconCmd { line: String },
    RconCmdAdd {
        name: String,
        help: String,
        params: String,
    },
    RconCmdRem { name: String },

    // ─── Latency ───
    Ping,
    PingReply,
}

impl NetMsg {
    /// Decodes a system packet, checking that the tag matches the payload.
    pub fn from_packet(packet: &Packet) -> ClientResult<Self> {
        if !packet.system {
            return Err(ClientError::protocol("not a system message"));
        }
        let msg: NetMsg = serde_json::from_slice(&packet.payload)?;
        if msg.msg_id() != packet.msg_id {
            return Err(ClientError::protocol(format!(
                "message id {} does not match payload {}",
                packet.msg_id,
                msg.msg_id()
            )));
        }
        Ok(msg)
    }
}

impl ProtocolMessage for NetMsg {
    fn msg_id(&self) -> u16 {
        match self {
            NetMsg::Info { .. } => msg_id::INFO,
            NetMsg::MapChange(_) => msg_id::MAP_CHANGE,
            NetMsg::RequestMapData { .. } => msg_id::REQUEST_MAP_DATA,
            NetMsg::MapData { .. } => msg_id::MAP_DATA,
            NetMsg::Ready => msg_id::READY,
            NetMsg::ConReady => msg_id::CON_READY,
            NetMsg::EnterGame => msg_id::ENTER_GAME,
            NetMsg::ServerInfo(_) => msg_id::SERVER_INFO,
            NetMsg::Snap { .. } => msg_id::SNAP,
            NetMsg::SnapEmpty { .. } => msg_id::SNAP_EMPTY,
            NetMsg::Input { .. } => msg_id::INPUT,
            NetMsg::InputTiming { .. } => msg_id::INPUT_TIMING,
            NetMsg::RconAuth { .. } => msg_id::RCON_AUTH,
            NetMsg::RconAuthStatus { .. } => msg_id::RCON_AUTH_STATUS,
            NetMsg::RconLine { .. } => msg_id::RCON_LINE,
            NetMsg::RconCmd { .. } => msg_id::RCON_CMD,
            NetMsg::RconCmdAdd { .. } => msg_id::RCON_CMD_ADD,
            NetMsg::RconCmdRem { .. } => msg_id::RCON_CMD_REM,
            NetMsg::Ping => msg_id::PING,
            NetMsg::PingReply => msg_id::PING_REPLY,
        }
    }

    fn is_system(&self) -> bool {
        true
    }

    fn pack(&self, out: &mut BytesMut) -> ClientResult<()> {
        let payload = serde_json::to_vec(self)?;
        out.extend_from_slice(&payload);
        Ok(())
    }
}

/// Something the transport observed since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake with the server completed.
    Connected(ClientSlot),
    /// An application packet arrived.
    Packet(ClientSlot, Packet),
    /// The connection was closed or failed.
    Closed(ClientSlot, String),
}

/// Non-blocking message transport shared by both sessions.
///
/// `poll` must return immediately; a round without data returns `None`.
pub trait Transport {
    /// Starts connecting `slot` to `addr` (`host:port`); completion is
    /// reported via `poll`.
    fn connect(&mut self, slot: ClientSlot, addr: &str) -> ClientResult<()>;

    /// Tears down `slot`. Safe to call when already disconnected.
    fn disconnect(&mut self, slot: ClientSlot, reason: &str);

    /// Queues a packet for `slot`.
    fn send(&mut self, slot: ClientSlot, packet: &Packet) -> ClientResult<()>;

    /// Returns the next pending event, if any.
    fn poll(&mut self) -> Option<TransportEvent>;
}
