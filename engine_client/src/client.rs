//! Client implementation.
//!
//! The client maintains:
//! - Two sessions (main and dummy) driven from one fixed-rate loop
//! - The connection state machine (handshake, map transfer, enter-game)
//! - Snapshot production from the network or from a demo
//! - Input generation for the active and the inactive slot
//! - The remote console and server metadata
//!
//! Nothing here blocks: `update` drains whatever the transport has and
//! returns. Transport, protocol and timeout failures end in a state
//! transition plus a retained error string; they are never returned from
//! `update`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use engine_shared::{
    config::EngineConfig,
    error::{ClientError, ClientResult, ErrorKind},
    net::{
        ClientSlot, MapDescriptor, MsgFlags, NetMsg, Packet, ProtocolMessage, ServerInfo,
        Transport, TransportEvent, NET_VERSION,
    },
    snapshot::SnapItem,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info, warn};

use crate::{
    demo::{demo_path, DemoFlush, DemoFrame, DemoPlayer, DemoSink, DemoWriter},
    hooks::GameHooks,
    interp::{FrameClock, TickClock},
    map::{ChunkOutcome, DirMapStorage, MapProgress, MapStorage},
    rcon::RconCommand,
    session::{PumpOutcome, Session, SessionPair},
    state::ClientState,
    store::{SnapSelector, SnapshotStore},
};

/// Length of a reconnect token.
const TIMEOUT_SEED_LEN: usize = 16;

/// A fresh random reconnect token.
pub fn generate_timeout_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TIMEOUT_SEED_LEN)
        .map(char::from)
        .collect()
}

/// High-level game client.
pub struct GameClient {
    config: EngineConfig,
    sessions: SessionPair,
    active: ClientSlot,

    transport: Box<dyn Transport>,
    hooks: Box<dyn GameHooks>,
    maps: Box<dyn MapStorage>,

    recorder: Option<Box<dyn DemoSink>>,
    /// Stopped recordings whose files are still being written.
    flushing: Vec<DemoFlush>,
    player: Option<DemoPlayer>,

    frame: FrameClock,
    /// Time of the current frame.
    now: Instant,
    timeout_seed: String,
    quitting: bool,
}

impl GameClient {
    pub fn new(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        hooks: Box<dyn GameHooks>,
        now: Instant,
    ) -> Self {
        let maps = Box::new(DirMapStorage::new(&config.maps_dir));
        Self {
            sessions: SessionPair::new(&config, now),
            active: config.dummy_slot,
            transport,
            hooks,
            maps,
            recorder: None,
            flushing: Vec::new(),
            player: None,
            frame: FrameClock::new(now, config.tick_hz),
            now,
            timeout_seed: generate_timeout_code(),
            quitting: false,
            config,
        }
    }

    /// Replaces the map storage.
    pub fn with_map_storage(mut self, maps: Box<dyn MapStorage>) -> Self {
        self.maps = maps;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Re-injects configuration. Tick rate, policy constants and snapshot
    /// limits apply immediately; connections are kept.
    pub fn set_config(&mut self, config: EngineConfig) {
        self.sessions.main.configure(&config);
        self.sessions.dummy.configure(&config);
        self.frame.set_tick_hz(config.tick_hz);
        self.config = config;
    }

    fn ensure_running(&self) -> ClientResult<()> {
        if self.quitting {
            Err(ClientError::Quitting)
        } else {
            Ok(())
        }
    }

    // ─── State ───

    /// State of the main session.
    pub fn state(&self) -> ClientState {
        self.sessions.main.state()
    }

    pub fn state_of(&self, slot: ClientSlot) -> ClientState {
        self.sessions.get(slot).state()
    }

    pub fn session(&self, slot: ClientSlot) -> &Session {
        self.sessions.get(slot)
    }

    /// Slot used for input routing and rendering.
    pub fn active_slot(&self) -> ClientSlot {
        self.active
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    // ─── Session control ───

    /// Connects the main session to `addr`, leaving any current session first.
    pub fn connect(&mut self, addr: &str) -> ClientResult<()> {
        self.ensure_running()?;
        match self.sessions.main.state() {
            ClientState::Offline => {}
            ClientState::DemoPlayback => self.demo_stop()?,
            _ => self.drop_session(ClientSlot::Main, "reconnecting")?,
        }
        self.connect_slot(ClientSlot::Main, addr)
    }

    fn connect_slot(&mut self, slot: ClientSlot, addr: &str) -> ClientResult<()> {
        let now = self.now;
        self.sessions
            .get_mut(slot)
            .begin_connect(addr, now, self.hooks.as_mut())?;
        info!(slot = %slot, addr, "Connecting");
        if let Err(err) = self.transport.connect(slot, addr) {
            warn!(slot = %slot, error = %err, "Connect failed");
            self.sessions
                .get_mut(slot)
                .cancel(&err.to_string(), now, self.hooks.as_mut())?;
            return Err(err);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) -> ClientResult<()> {
        self.disconnect_with_reason("")
    }

    /// Leaves the main session (and with it the dummy) or stops demo playback.
    pub fn disconnect_with_reason(&mut self, reason: &str) -> ClientResult<()> {
        self.ensure_running()?;
        if self.sessions.main.state() == ClientState::DemoPlayback {
            return self.demo_stop();
        }
        self.drop_session(ClientSlot::Main, reason)
    }

    /// Tears `slot` down in one step. Dropping main drops the dummy first and
    /// stops demo recording.
    fn drop_session(&mut self, slot: ClientSlot, reason: &str) -> ClientResult<()> {
        let now = self.now;
        if slot == ClientSlot::Main {
            self.drop_session(ClientSlot::Dummy, "main session disconnected")?;
            self.demo_recorder_stop();
        }

        let session = self.sessions.get_mut(slot);
        let was = session.state();
        if was.has_connection() {
            info!(slot = %slot, reason, "Disconnecting");
            self.transport.disconnect(slot, reason);
        }
        session.cancel(reason, now, self.hooks.as_mut())?;

        if slot == ClientSlot::Dummy && was != ClientState::Offline {
            self.hooks.on_dummy_disconnect(reason);
            if self.active == ClientSlot::Dummy {
                self.active = ClientSlot::Main;
                self.hooks.on_dummy_swap(self.active);
            }
        }
        Ok(())
    }

    /// Drops `slot` after a recoverable failure, keeping `err` as the reason.
    fn fail_session(&mut self, slot: ClientSlot, err: ClientError) {
        warn!(slot = %slot, error = %err, "Session failed");
        if let Err(e) = self.drop_session(slot, &err.to_string()) {
            warn!(slot = %slot, error = %e, "Could not drop session");
        }
    }

    /// Terminal shutdown: releases both connections, the demo recorder and
    /// the demo player. Further calls are no-ops.
    pub fn quit(&mut self) -> ClientResult<()> {
        if self.quitting {
            return Ok(());
        }
        let now = self.now;
        self.demo_recorder_stop();
        self.player = None;
        for slot in [ClientSlot::Dummy, ClientSlot::Main] {
            let session = self.sessions.get_mut(slot);
            if session.state().has_connection() {
                self.transport.disconnect(slot, "quit");
            }
            session.quit(now, self.hooks.as_mut())?;
        }
        self.quitting = true;
        info!("Client quitting");
        self.hooks.on_shutdown();
        Ok(())
    }

    /// Sends enter-game for the main session and restarts its tick state.
    pub fn enter_game(&mut self) -> ClientResult<()> {
        self.ensure_running()?;
        self.enter_game_slot(ClientSlot::Main)
    }

    fn enter_game_slot(&mut self, slot: ClientSlot) -> ClientResult<()> {
        if self.sessions.get(slot).state() != ClientState::Online {
            return Err(ClientError::SessionUnavailable {
                slot,
                reason: "not online".into(),
            });
        }
        self.send_pack_msg(slot, &NetMsg::EnterGame, MsgFlags::VITAL | MsgFlags::FLUSH)?;
        self.sessions.get_mut(slot).enter_game_reset();
        debug!(slot = %slot, "Entered game");
        self.hooks.on_enter_game(slot);
        Ok(())
    }

    /// Replaces the reconnect token sent with the next connect.
    pub fn generate_timeout_seed(&mut self) -> &str {
        self.timeout_seed = generate_timeout_code();
        &self.timeout_seed
    }

    pub fn timeout_seed(&self) -> &str {
        &self.timeout_seed
    }

    // ─── Dummy ───

    /// Connects the dummy to the main session's server. Main must be Online.
    pub fn dummy_connect(&mut self) -> ClientResult<()> {
        self.ensure_running()?;
        let main = &self.sessions.main;
        if main.state() != ClientState::Online {
            return Err(ClientError::SessionUnavailable {
                slot: ClientSlot::Dummy,
                reason: "main session is not online".into(),
            });
        }
        if self.sessions.dummy.state() != ClientState::Offline {
            return Err(ClientError::SessionUnavailable {
                slot: ClientSlot::Dummy,
                reason: format!("dummy is already {}", self.sessions.dummy.state()),
            });
        }
        let addr = main
            .server_address()
            .map(str::to_string)
            .ok_or_else(|| ClientError::SessionUnavailable {
                slot: ClientSlot::Dummy,
                reason: "main session has no server address".into(),
            })?;
        self.connect_slot(ClientSlot::Dummy, &addr)
    }

    /// Always safe, even when the dummy is already offline.
    pub fn dummy_disconnect(&mut self, reason: &str) -> ClientResult<()> {
        self.ensure_running()?;
        self.drop_session(ClientSlot::Dummy, reason)
    }

    pub fn dummy_connected(&self) -> bool {
        self.sessions.dummy.state() == ClientState::Online
    }

    pub fn dummy_connecting(&self) -> bool {
        self.sessions.dummy.state().is_connecting()
    }

    /// Exchanges the active slot. Both connections stay up.
    pub fn dummy_swap(&mut self) -> ClientResult<ClientSlot> {
        self.ensure_running()?;
        let target = self.active.other();
        if target == ClientSlot::Dummy && !self.dummy_connected() {
            return Err(ClientError::SessionUnavailable {
                slot: ClientSlot::Dummy,
                reason: "dummy is not online".into(),
            });
        }
        self.active = target;
        info!(active = %target, "Swapped active slot");
        self.hooks.on_dummy_swap(target);
        Ok(target)
    }

    // ─── Messages ───

    /// Sends `packet` on `slot`. `RECORD` also writes it to the demo,
    /// `NOSEND` skips the transport.
    pub fn send_msg(&mut self, slot: ClientSlot, packet: &Packet) -> ClientResult<()> {
        self.ensure_running()?;
        let session = self.sessions.get(slot);
        if !session.state().has_connection() {
            return Err(ClientError::SessionUnavailable {
                slot,
                reason: format!("session is {}", session.state()),
            });
        }
        if slot == ClientSlot::Main {
            let persist = packet.flags.contains(MsgFlags::RECORD)
                && !packet.flags.contains(MsgFlags::NORECORD);
            if let Some(rec) = self.recorder.as_mut() {
                rec.record_message(session.clock().cur_tick(), packet, persist);
            }
        }
        if packet.flags.contains(MsgFlags::NOSEND) {
            return Ok(());
        }
        self.transport.send(slot, packet)
    }

    /// Packs `msg` and sends it on `slot`.
    pub fn send_pack_msg<M: ProtocolMessage>(
        &mut self,
        slot: ClientSlot,
        msg: &M,
        flags: MsgFlags,
    ) -> ClientResult<()> {
        let packet = msg.to_packet(flags)?;
        self.send_msg(slot, &packet)
    }

    /// Sends a system message; a failure drops the session.
    fn send_or_fail(&mut self, slot: ClientSlot, msg: &NetMsg, flags: MsgFlags) -> bool {
        match self.send_pack_msg(slot, msg, flags) {
            Ok(()) => true,
            Err(err) => {
                self.fail_session(slot, err);
                false
            }
        }
    }

    // ─── Frame update ───

    /// Runs one frame: drains the transport, advances the state machines,
    /// applies due snapshots, updates tick timing and sends input.
    pub fn update(&mut self, now: Instant) -> ClientResult<()> {
        self.ensure_running()?;
        self.now = now;
        self.frame.begin_frame(now);

        while let Some(event) = self.transport.poll() {
            self.handle_event(event, now);
        }
        for slot in ClientSlot::ALL {
            self.check_timeout(slot, now);
        }
        for slot in ClientSlot::ALL {
            self.pump_snapshots(slot, now);
        }
        for slot in ClientSlot::ALL {
            self.send_input(slot, now);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected(slot) => {
                let session = self.sessions.get_mut(slot);
                if session.state() != ClientState::Connecting {
                    debug!(slot = %slot, state = %session.state(), "Ignoring connect event");
                    return;
                }
                session.on_recv(now);
                if let Err(err) = session.set_state(ClientState::Loading, now, self.hooks.as_mut()) {
                    self.fail_session(slot, err);
                    return;
                }
                let info = NetMsg::Info {
                    version: NET_VERSION.to_string(),
                    password: self.config.password.clone(),
                    timeout_code: self.timeout_seed.clone(),
                };
                self.send_or_fail(slot, &info, MsgFlags::VITAL | MsgFlags::FLUSH);
            }
            TransportEvent::Closed(slot, reason) => {
                if self.sessions.get(slot).state().has_connection() {
                    self.fail_session(slot, ClientError::transport(reason));
                }
            }
            TransportEvent::Packet(slot, packet) => self.handle_packet(slot, packet, now),
        }
    }

    fn handle_packet(&mut self, slot: ClientSlot, packet: Packet, now: Instant) {
        let session = self.sessions.get_mut(slot);
        if !session.state().has_connection() {
            debug!(slot = %slot, msg_id = packet.msg_id, "Packet for idle session");
            return;
        }
        session.on_recv(now);

        if !packet.system {
            if slot == ClientSlot::Main {
                let persist = !packet.flags.contains(MsgFlags::NORECORD);
                if let Some(rec) = self.recorder.as_mut() {
                    rec.record_message(session.clock().cur_tick(), &packet, persist);
                }
            }
            self.hooks.on_message(slot, &packet);
            return;
        }

        match NetMsg::from_packet(&packet) {
            Ok(msg) => self.handle_system(slot, msg),
            Err(err) => self.protocol_strike(slot, err),
        }
    }

    fn protocol_strike(&mut self, slot: ClientSlot, err: ClientError) {
        if self.sessions.get_mut(slot).strike(&err) {
            self.fail_session(
                slot,
                ClientError::protocol(format!("too many protocol errors, last: {err}")),
            );
        }
    }

    fn handle_system(&mut self, slot: ClientSlot, msg: NetMsg) {
        let session = self.sessions.get_mut(slot);
        match msg {
            NetMsg::MapChange(map) => self.on_map_change(slot, map),
            NetMsg::MapData { chunk, last, data } => self.on_map_data(slot, chunk, last, &data),
            NetMsg::ConReady => {
                session.set_con_ready();
                self.try_go_online(slot);
            }
            NetMsg::ServerInfo(info) => session.set_server_info(info),
            NetMsg::Snap { tick, data } => {
                if session.state() == ClientState::Online {
                    session.queue_mut().push(tick, data);
                }
            }
            NetMsg::SnapEmpty { tick } => {
                if session.state() == ClientState::Online {
                    session.queue_mut().push(tick, Vec::new());
                }
            }
            NetMsg::InputTiming {
                input_pred_tick,
                time_left_ms,
            } => session.inputs_mut().on_timing(input_pred_tick, time_left_ms),
            NetMsg::RconAuthStatus { authed, cmdlist } => {
                info!(slot = %slot, authed, cmdlist, "Rcon auth status");
                session.rcon_mut().apply_auth_status(authed, cmdlist);
            }
            NetMsg::RconLine { line } => self.hooks.on_rcon_line(slot, &line),
            NetMsg::RconCmdAdd { name, help, params } => {
                session
                    .rcon_mut()
                    .add_command(RconCommand { name, help, params });
            }
            NetMsg::RconCmdRem { name } => {
                session.rcon_mut().remove_command(&name);
            }
            NetMsg::Ping => {
                self.send_or_fail(slot, &NetMsg::PingReply, MsgFlags::empty());
            }
            NetMsg::PingReply => {}
            other => {
                let err = ClientError::protocol(format!(
                    "unexpected message id {} from server",
                    other.msg_id()
                ));
                self.protocol_strike(slot, err);
            }
        }
    }

    fn on_map_change(&mut self, slot: ClientSlot, map: MapDescriptor) {
        let found = self.maps.find(&map);
        info!(
            slot = %slot,
            map = %map.name,
            size = map.size,
            local = found.is_some(),
            "Map change"
        );
        let too_large = found.is_none() && map.size > self.config.max_map_size;
        let err = too_large.then(|| {
            ClientError::resource(format!(
                "map {} is {} bytes, download limit is {}",
                map.name, map.size, self.config.max_map_size
            ))
        });
        let session = self.sessions.get_mut(slot);
        session.start_map(map, found.clone());
        if let Some(err) = err {
            session.block_on_resource(&err);
            return;
        }
        if found.is_some() {
            if self.send_or_fail(slot, &NetMsg::Ready, MsgFlags::VITAL | MsgFlags::FLUSH) {
                self.try_go_online(slot);
            }
        } else {
            self.send_or_fail(
                slot,
                &NetMsg::RequestMapData { chunk: 0 },
                MsgFlags::VITAL | MsgFlags::FLUSH,
            );
        }
    }

    fn on_map_data(&mut self, slot: ClientSlot, chunk: u32, last: bool, data: &[u8]) {
        let session = self.sessions.get_mut(slot);
        let Some(download) = session.download_mut() else {
            self.protocol_strike(slot, ClientError::protocol("map data without a download"));
            return;
        };

        match download.push_chunk(chunk, last, data) {
            Ok(ChunkOutcome::More { next }) => {
                debug!(slot = %slot, chunk = next, "Requesting map chunk");
                self.send_or_fail(
                    slot,
                    &NetMsg::RequestMapData { chunk: next },
                    MsgFlags::VITAL | MsgFlags::FLUSH,
                );
            }
            Ok(ChunkOutcome::Complete) => {
                let Some(download) = session.take_download() else {
                    return;
                };
                let (map, bytes) = download.into_parts();
                info!(slot = %slot, map = %map.name, bytes = bytes.len(), "Map download finished");
                match self.maps.store(&map, &bytes) {
                    Ok(path) => {
                        session.finish_map(path);
                        if self.send_or_fail(slot, &NetMsg::Ready, MsgFlags::VITAL | MsgFlags::FLUSH) {
                            self.try_go_online(slot);
                        }
                    }
                    Err(err) => session.block_on_resource(&err),
                }
            }
            Err(err) if err.kind() == ErrorKind::Resource => session.block_on_resource(&err),
            Err(err) => self.protocol_strike(slot, err),
        }
    }

    fn try_go_online(&mut self, slot: ClientSlot) {
        let now = self.now;
        let session = self.sessions.get_mut(slot);
        if !session.ready_for_online() {
            return;
        }
        if let Err(err) = session.set_state(ClientState::Online, now, self.hooks.as_mut()) {
            self.fail_session(slot, err);
            return;
        }
        info!(slot = %slot, "Connected");
        self.hooks.on_connected(slot);
        if let Err(err) = self.enter_game_slot(slot) {
            self.fail_session(slot, err);
        }
    }

    fn check_timeout(&mut self, slot: ClientSlot, now: Instant) {
        let session = self.sessions.get(slot);
        let err = match session.state() {
            ClientState::Connecting | ClientState::Loading => {
                let waited = now.saturating_duration_since(session.state_since());
                (!session.is_resource_blocked() && waited > self.config.connect_timeout())
                    .then(|| ClientError::Timeout(format!("no progress in {}", session.state())))
            }
            ClientState::Online => {
                let last = session.last_recv().unwrap_or(session.state_since());
                (now.saturating_duration_since(last) > self.config.timeout())
                    .then(|| ClientError::Timeout("server stopped responding".into()))
            }
            _ => None,
        };
        if let Some(err) = err {
            self.fail_session(slot, err);
        }
    }

    fn pump_snapshots(&mut self, slot: ClientSlot, now: Instant) {
        let state = self.sessions.get(slot).state();
        let result = match (slot, state) {
            (ClientSlot::Main, ClientState::DemoPlayback) => {
                let Some(mut player) = self.player.take() else {
                    return;
                };
                let result = self.sessions.main.pump(&mut player, now, &mut None);
                self.player = Some(player);
                result
            }
            (ClientSlot::Main, ClientState::Online) => {
                self.sessions.main.pump_network(now, &mut self.recorder)
            }
            (ClientSlot::Dummy, ClientState::Online) => {
                self.sessions.dummy.pump_network(now, &mut None)
            }
            _ => return,
        };

        match result {
            Ok(outcome) => self.deliver(slot, state, outcome),
            Err(err) if state == ClientState::DemoPlayback => {
                warn!(error = %err, "Demo playback failed");
                self.stop_playback(&err.to_string());
            }
            Err(err) => self.fail_session(slot, err),
        }
    }

    fn deliver(&mut self, slot: ClientSlot, state: ClientState, outcome: PumpOutcome) {
        for tick in &outcome.applied {
            self.hooks.on_new_snapshot(slot, *tick);
        }
        for packet in &outcome.messages {
            self.hooks.on_message(slot, packet);
        }
        if state == ClientState::DemoPlayback && outcome.finished {
            info!("Demo playback finished");
            self.stop_playback("demo finished");
        }
    }

    fn send_input(&mut self, slot: ClientSlot, now: Instant) {
        let keepalive = i64::from(self.config.input_keepalive_ticks);
        let session = self.sessions.get_mut(slot);
        let Some(pred_tick) = session.input_due() else {
            return;
        };
        let last_tick = session.inputs().last_tick();
        let force = last_tick < 0 || i64::from(pred_tick) - i64::from(last_tick) >= keepalive;
        let Some(data) = self.hooks.on_snap_input(slot, force) else {
            return;
        };
        if !session.inputs().should_send(&data, force) {
            return;
        }
        let msg = NetMsg::Input {
            ack_tick: session.clock().cur_tick(),
            pred_tick,
            data: data.clone(),
        };
        if self.send_or_fail(slot, &msg, MsgFlags::empty()) {
            self.sessions
                .get_mut(slot)
                .inputs_mut()
                .push(pred_tick, data, now);
        }
    }

    /// Input sent on the active slot for `tick`.
    pub fn get_input(&self, tick: i32) -> Option<&[i32]> {
        self.get_input_for(self.active, tick)
    }

    pub fn get_input_for(&self, slot: ClientSlot, tick: i32) -> Option<&[i32]> {
        self.sessions
            .get(slot)
            .inputs()
            .get(tick)
            .map(|input| input.data.as_slice())
    }

    /// Spread of recent input arrival margins on the active slot, in ms.
    pub fn input_margin_stability_score(&self) -> f32 {
        self.sessions
            .get(self.active)
            .inputs()
            .margin_stability_score()
    }

    // ─── Snapshots (active slot) ───

    pub fn snapshots(&self) -> &SnapshotStore {
        self.sessions.get(self.active).store()
    }

    pub fn snapshots_for(&self, slot: ClientSlot) -> &SnapshotStore {
        self.sessions.get(slot).store()
    }

    pub fn snap_num_items(&self, sel: SnapSelector) -> usize {
        self.snapshots().count(sel)
    }

    pub fn snap_find_item(&self, sel: SnapSelector, type_id: u16, id: u16) -> Option<&[u8]> {
        self.snapshots().find(sel, type_id, id)
    }

    pub fn snap_get_item(&self, sel: SnapSelector, index: usize) -> Option<(SnapItem, &[u8])> {
        self.snapshots().get(sel, index)
    }

    pub fn snap_item_size(&self, sel: SnapSelector, index: usize) -> Option<usize> {
        self.snapshots().size(sel, index)
    }

    pub fn snap_invalidate_item(&mut self, sel: SnapSelector, index: usize) -> bool {
        self.sessions
            .get_mut(self.active)
            .store_mut()
            .invalidate(sel, index)
    }

    /// Registers a static item size on both sessions.
    pub fn snap_set_static_size(&mut self, type_id: u16, size: usize) -> ClientResult<()> {
        self.sessions
            .main
            .store_mut()
            .register_static_size(type_id, size)?;
        self.sessions
            .dummy
            .store_mut()
            .register_static_size(type_id, size)
    }

    // ─── Timing (active slot) ───

    pub fn clock(&self) -> &TickClock {
        self.sessions.get(self.active).clock()
    }

    pub fn clock_for(&self, slot: ClientSlot) -> &TickClock {
        self.sessions.get(slot).clock()
    }

    pub fn game_tick(&self) -> i32 {
        self.clock().cur_tick()
    }

    pub fn prev_game_tick(&self) -> i32 {
        self.clock().prev_tick()
    }

    pub fn intra_game_tick(&self) -> f32 {
        self.clock().intra_tick()
    }

    pub fn pred_game_tick(&self) -> i32 {
        self.clock().pred_tick()
    }

    pub fn pred_intra_game_tick(&self) -> f32 {
        self.clock().pred_intra_tick()
    }

    pub fn game_tick_speed(&self) -> u32 {
        self.frame.game_tick_speed()
    }

    pub fn local_time(&self) -> f32 {
        self.frame.local_time()
    }

    pub fn render_frame_time(&self) -> f32 {
        self.frame.render_frame_time()
    }

    pub fn menu_tick(&self) -> i64 {
        self.frame.menu_tick()
    }

    // ─── Remote console (main session) ───

    pub fn rcon_auth(&mut self, name: &str, password: &str) -> ClientResult<()> {
        let msg = NetMsg::RconAuth {
            name: name.to_string(),
            password: password.to_string(),
        };
        self.send_pack_msg(ClientSlot::Main, &msg, MsgFlags::VITAL)
    }

    pub fn rcon(&mut self, line: &str) -> ClientResult<()> {
        if !self.rcon_authed() {
            debug!(line, "Rcon command while not authenticated");
        }
        let msg = NetMsg::RconCmd {
            line: line.to_string(),
        };
        self.send_pack_msg(ClientSlot::Main, &msg, MsgFlags::VITAL)
    }

    pub fn rcon_authed(&self) -> bool {
        self.sessions.main.rcon().authed()
    }

    pub fn uses_temporary_commands(&self) -> bool {
        self.sessions.main.rcon().uses_temporary_commands()
    }

    pub fn rcon_commands(&self) -> impl Iterator<Item = &RconCommand> {
        self.sessions.main.rcon().commands()
    }

    // ─── Server metadata and map ───

    pub fn get_server_info(&self) -> ServerInfo {
        let main = &self.sessions.main;
        let mut info = main.server_info().clone();
        if info.address.is_empty() {
            info.address = main.server_address().unwrap_or_default().to_string();
        }
        info
    }

    pub fn map_download_progress(&self) -> Option<MapProgress> {
        self.sessions.main.map_progress()
    }

    pub fn current_map(&self) -> Option<&MapDescriptor> {
        self.sessions.main.map()
    }

    pub fn current_map_path(&self) -> Option<&Path> {
        self.sessions.main.map_path()
    }

    // ─── Diagnostics ───

    pub fn error_string(&self) -> &str {
        self.sessions.main.error_string()
    }

    pub fn server_address(&self) -> Option<&str> {
        self.sessions.main.server_address()
    }

    /// True when an Online main session has heard nothing for
    /// `connection_problem_ms`.
    pub fn connection_problems(&self) -> bool {
        let main = &self.sessions.main;
        if main.state() != ClientState::Online {
            return false;
        }
        let last = main.last_recv().unwrap_or(main.state_since());
        self.now.saturating_duration_since(last) > self.config.connection_problem_after()
    }

    // ─── Demo ───

    /// Records the main session to `<demos_dir>/<name>[_<timestamp>].demo`.
    pub fn demo_recorder_start(&mut self, name: &str, with_timestamp: bool) -> anyhow::Result<PathBuf> {
        let path = demo_path(Path::new(&self.config.demos_dir), name, with_timestamp);
        if self.sessions.main.state() != ClientState::Online {
            anyhow::bail!("demo recording needs an online main session");
        }
        let writer = DemoWriter::create(path.clone())
            .with_context(|| format!("start recording {}", path.display()))?;
        self.start_recording(Box::new(writer))?;
        Ok(path)
    }

    /// Starts recording the main session into `sink`.
    pub fn start_recording(&mut self, mut sink: Box<dyn DemoSink>) -> ClientResult<()> {
        self.ensure_running()?;
        if self.sessions.main.state() != ClientState::Online {
            return Err(ClientError::SessionUnavailable {
                slot: ClientSlot::Main,
                reason: "recording needs an online session".into(),
            });
        }
        self.demo_recorder_stop();
        sink.write_frame(DemoFrame::header(
            self.sessions.main.map().cloned(),
            self.config.tick_hz,
        ));
        info!("Demo recording started");
        self.recorder = Some(sink);
        Ok(())
    }

    pub fn demo_recorder_stop(&mut self) {
        if let Some(mut sink) = self.recorder.take() {
            self.flushing.retain(|task| !task.is_finished());
            self.flushing.extend(sink.finish());
            info!("Demo recording stopped");
        }
    }

    /// Waits until every stopped recording is on disk. Call before the
    /// runtime shuts down. Returns the number of frames written.
    pub async fn flush_demos(&mut self) -> anyhow::Result<u64> {
        let mut written = 0;
        for task in self.flushing.drain(..) {
            written += task.await.context("demo writer task")??;
        }
        Ok(written)
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Leaves any session and plays `player` on the main slot.
    pub fn demo_play(&mut self, player: DemoPlayer) -> ClientResult<()> {
        self.ensure_running()?;
        match self.sessions.main.state() {
            ClientState::Offline => {}
            ClientState::DemoPlayback => self.stop_playback("new demo"),
            _ => self.drop_session(ClientSlot::Main, "demo playback")?,
        }
        let now = self.now;
        self.sessions.main.begin_demo(now, self.hooks.as_mut())?;
        info!(frames = player.total(), tick_hz = player.tick_hz(), "Demo playback started");
        self.player = Some(player);
        Ok(())
    }

    pub fn demo_play_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let player = DemoPlayer::load(path)?;
        self.demo_play(player)
            .with_context(|| format!("play demo {}", path.display()))
    }

    /// Stops playback; the main session returns to Offline with empty buffers.
    pub fn demo_stop(&mut self) -> ClientResult<()> {
        self.ensure_running()?;
        if self.sessions.main.state() != ClientState::DemoPlayback {
            return Err(ClientError::SessionUnavailable {
                slot: ClientSlot::Main,
                reason: "no demo is playing".into(),
            });
        }
        self.stop_playback("demo stopped");
        Ok(())
    }

    fn stop_playback(&mut self, reason: &str) {
        let now = self.now;
        self.player = None;
        if let Err(err) = self.sessions.main.cancel(reason, now, self.hooks.as_mut()) {
            warn!(error = %err, "Could not stop demo playback");
        }
    }

    pub fn demo_player(&self) -> Option<&DemoPlayer> {
        self.player.as_ref()
    }

    pub fn demo_pause(&mut self, paused: bool) {
        if let Some(player) = self.player.as_mut() {
            player.set_paused(paused);
        }
    }

    pub fn demo_set_speed(&mut self, speed: f32) {
        if let Some(player) = self.player.as_mut() {
            player.set_speed(speed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHooks;

    /// Transport that accepts everything and reports nothing.
    #[derive(Default)]
    struct NullTransport {
        sent: Vec<(ClientSlot, Packet)>,
    }

    impl Transport for NullTransport {
        fn connect(&mut self, _slot: ClientSlot, _addr: &str) -> ClientResult<()> {
            Ok(())
        }

        fn disconnect(&mut self, _slot: ClientSlot, _reason: &str) {}

        fn send(&mut self, slot: ClientSlot, packet: &Packet) -> ClientResult<()> {
            self.sent.push((slot, packet.clone()));
            Ok(())
        }

        fn poll(&mut self) -> Option<TransportEvent> {
            None
        }
    }

    fn client() -> (GameClient, Instant) {
        let now = Instant::now();
        let client = GameClient::new(
            EngineConfig::default(),
            Box::new(NullTransport::default()),
            Box::new(NoopHooks),
            now,
        );
        (client, now)
    }

    #[test]
    fn timeout_seed_is_alphanumeric() {
        let code = generate_timeout_code();
        assert_eq!(code.len(), TIMEOUT_SEED_LEN);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn connect_enters_connecting() {
        let (mut c, _) = client();
        c.connect("server:8303").unwrap();
        assert_eq!(c.state(), ClientState::Connecting);
        assert_eq!(c.server_address(), Some("server:8303"));
    }

    #[test]
    fn connecting_times_out() {
        let (mut c, now) = client();
        c.connect("server:8303").unwrap();
        c.update(now + c.config().connect_timeout() * 2).unwrap();
        assert_eq!(c.state(), ClientState::Offline);
        assert!(c.error_string().contains("timed out"));
    }

    #[test]
    fn dummy_requires_online_main() {
        let (mut c, _) = client();
        assert!(c.dummy_connect().is_err());
        assert!(c.dummy_swap().is_err());
        c.dummy_disconnect("nothing to do").unwrap();
        assert_eq!(c.state_of(ClientSlot::Dummy), ClientState::Offline);
    }

    #[test]
    fn quit_is_terminal() {
        let (mut c, now) = client();
        c.connect("server:8303").unwrap();
        c.quit().unwrap();
        assert_eq!(c.state(), ClientState::Quitting);
        assert_eq!(c.state_of(ClientSlot::Dummy), ClientState::Quitting);
        assert_eq!(c.connect("server:8303").unwrap_err(), ClientError::Quitting);
        assert_eq!(c.update(now).unwrap_err(), ClientError::Quitting);
        c.quit().unwrap();
    }

    #[test]
    fn send_on_idle_session_fails() {
        let (mut c, _) = client();
        let err = c
            .send_pack_msg(ClientSlot::Main, &NetMsg::Ping, MsgFlags::VITAL)
            .unwrap_err();
        assert!(matches!(err, ClientError::SessionUnavailable { .. }));
    }
}
