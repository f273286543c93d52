//! One logical server connection.
//!
//! A [`Session`] bundles the connection state, snapshot store, tick clock,
//! map transfer, rcon flags and input history of one slot. The client owns
//! exactly two of them ([`SessionPair`]); they never share mutable state.

use std::mem;
use std::path::{Path, PathBuf};
use std::time::Instant;

use engine_shared::{
    config::EngineConfig,
    error::{ClientError, ClientResult},
    net::{ClientSlot, MapDescriptor, Packet, ServerInfo},
};
use tracing::{debug, info, warn};

use crate::{
    demo::DemoSink,
    hooks::GameHooks,
    input::InputHistory,
    interp::{is_valid_tick, TickClock},
    map::{MapDownload, MapProgress},
    producer::{NetSnapshotQueue, Produced, SnapshotProducer},
    rcon::RconState,
    state::ClientState,
    store::{SnapSelector, SnapshotStore},
};

/// Result of draining a producer for one frame.
#[derive(Debug, Default)]
pub struct PumpOutcome {
    /// Ticks committed to the store, in order.
    pub applied: Vec<i32>,
    /// Late or duplicate ticks that were dropped.
    pub stale: usize,
    /// Messages the producer emitted.
    pub messages: Vec<Packet>,
    /// The producer will never yield again.
    pub finished: bool,
}

#[derive(Debug)]
pub struct Session {
    slot: ClientSlot,
    state: ClientState,
    state_since: Instant,

    store: SnapshotStore,
    clock: TickClock,
    queue: NetSnapshotQueue,

    server_addr: Option<String>,
    server_info: ServerInfo,
    last_recv: Option<Instant>,
    last_error: String,
    protocol_strikes: u32,
    protocol_tolerance: u32,

    map: Option<MapDescriptor>,
    map_path: Option<PathBuf>,
    download: Option<MapDownload>,
    map_ready: bool,
    con_ready: bool,
    /// Map transfer failed; waiting for a new map change or a disconnect.
    resource_blocked: bool,

    rcon: RconState,
    inputs: InputHistory,
    input_polled_tick: i32,
}

impl Session {
    pub fn new(slot: ClientSlot, cfg: &EngineConfig, now: Instant) -> Self {
        Self {
            slot,
            state: ClientState::Offline,
            state_since: now,
            store: SnapshotStore::new(cfg.snapshot_limits),
            clock: TickClock::new(cfg),
            queue: NetSnapshotQueue::new(),
            server_addr: None,
            server_info: ServerInfo::default(),
            last_recv: None,
            last_error: String::new(),
            protocol_strikes: 0,
            protocol_tolerance: cfg.protocol_error_tolerance,
            map: None,
            map_path: None,
            download: None,
            map_ready: false,
            con_ready: false,
            resource_blocked: false,
            rcon: RconState::default(),
            inputs: InputHistory::new(),
            input_polled_tick: -1,
        }
    }

    /// Re-reads configuration; takes effect without reconnecting.
    pub fn configure(&mut self, cfg: &EngineConfig) {
        self.clock.configure(cfg);
        self.store.set_limits(cfg.snapshot_limits);
        self.protocol_tolerance = cfg.protocol_error_tolerance;
    }

    pub fn slot(&self) -> ClientSlot {
        self.slot
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// When the current state was entered.
    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SnapshotStore {
        &mut self.store
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    pub fn rcon(&self) -> &RconState {
        &self.rcon
    }

    pub fn rcon_mut(&mut self) -> &mut RconState {
        &mut self.rcon
    }

    pub fn inputs(&self) -> &InputHistory {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut InputHistory {
        &mut self.inputs
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Replaces the server metadata wholesale.
    pub fn set_server_info(&mut self, info: ServerInfo) {
        self.server_info = info;
    }

    pub fn server_address(&self) -> Option<&str> {
        self.server_addr.as_deref()
    }

    /// Reason for the last failure; empty if none.
    pub fn error_string(&self) -> &str {
        &self.last_error
    }

    pub fn last_recv(&self) -> Option<Instant> {
        self.last_recv
    }

    pub fn on_recv(&mut self, now: Instant) {
        self.last_recv = Some(now);
    }

    pub fn map(&self) -> Option<&MapDescriptor> {
        self.map.as_ref()
    }

    pub fn map_path(&self) -> Option<&Path> {
        self.map_path.as_deref()
    }

    pub fn map_progress(&self) -> Option<MapProgress> {
        self.download.as_ref().map(MapDownload::progress)
    }

    pub fn download_mut(&mut self) -> Option<&mut MapDownload> {
        self.download.as_mut()
    }

    pub fn is_resource_blocked(&self) -> bool {
        self.resource_blocked
    }

    pub fn queue_mut(&mut self) -> &mut NetSnapshotQueue {
        &mut self.queue
    }

    /// Changes state and notifies the game layer before returning.
    /// Re-entering the current state is a no-op. Returns the old state.
    pub fn set_state(
        &mut self,
        next: ClientState,
        now: Instant,
        hooks: &mut dyn GameHooks,
    ) -> ClientResult<ClientState> {
        let old = self.state;
        if next == old {
            return Ok(old);
        }
        if !old.can_transition_to(next) {
            return Err(ClientError::InvalidTransition {
                from: old.name(),
                to: next.name(),
            });
        }
        self.state = next;
        self.state_since = now;
        info!(slot = %self.slot, from = %old, to = %next, "State change");
        hooks.on_state_change(self.slot, next, old);
        Ok(old)
    }

    /// Forgets everything tied to a connection: buffers, tick state, map
    /// transfer, rcon flags, inputs and strike count.
    fn reset_connection(&mut self) {
        self.store.reset_session();
        self.clock.reset();
        self.queue.clear();
        self.server_info = ServerInfo::default();
        self.last_recv = None;
        self.protocol_strikes = 0;
        self.map = None;
        self.map_path = None;
        self.download = None;
        self.map_ready = false;
        self.con_ready = false;
        self.resource_blocked = false;
        self.rcon.reset();
        self.inputs.clear();
        self.input_polled_tick = -1;
    }

    /// Offline -> Connecting with all state from a prior connection dropped.
    pub fn begin_connect(
        &mut self,
        addr: &str,
        now: Instant,
        hooks: &mut dyn GameHooks,
    ) -> ClientResult<()> {
        if !self.state.can_transition_to(ClientState::Connecting) {
            return Err(ClientError::InvalidTransition {
                from: self.state.name(),
                to: ClientState::Connecting.name(),
            });
        }
        self.reset_connection();
        self.server_addr = Some(addr.to_string());
        self.last_error.clear();
        self.set_state(ClientState::Connecting, now, hooks)?;
        Ok(())
    }

    /// Offline -> DemoPlayback with clean buffers.
    pub fn begin_demo(&mut self, now: Instant, hooks: &mut dyn GameHooks) -> ClientResult<()> {
        if !self.state.can_transition_to(ClientState::DemoPlayback) {
            return Err(ClientError::InvalidTransition {
                from: self.state.name(),
                to: ClientState::DemoPlayback.name(),
            });
        }
        self.reset_connection();
        self.last_error.clear();
        self.set_state(ClientState::DemoPlayback, now, hooks)?;
        Ok(())
    }

    /// Leaves the session in one step: aborts the map transfer, empties both
    /// snapshot buffers, resets tick and prediction state, records `reason`,
    /// then transitions to Offline. Safe to call when already Offline.
    pub fn cancel(&mut self, reason: &str, now: Instant, hooks: &mut dyn GameHooks) -> ClientResult<()> {
        if self.state == ClientState::Quitting {
            return Ok(());
        }
        if let Some(download) = &self.download {
            info!(slot = %self.slot, map = %download.map().name, "Aborting map download");
        }
        self.reset_connection();
        if !reason.is_empty() {
            self.last_error = reason.to_string();
        }
        self.set_state(ClientState::Offline, now, hooks)?;
        Ok(())
    }

    /// Final transition. Releases everything the session holds.
    pub fn quit(&mut self, now: Instant, hooks: &mut dyn GameHooks) -> ClientResult<()> {
        self.reset_connection();
        self.set_state(ClientState::Quitting, now, hooks)?;
        Ok(())
    }

    /// Tick state is restarted when the game is (re-)entered.
    pub fn enter_game_reset(&mut self) {
        self.store.clear();
        self.clock.reset();
        self.queue.clear();
        self.inputs.clear();
        self.input_polled_tick = -1;
    }

    /// The server announced a map. `found` is its local path, if any.
    pub fn start_map(&mut self, map: MapDescriptor, found: Option<PathBuf>) {
        self.resource_blocked = false;
        self.map_ready = found.is_some();
        self.download = match found {
            Some(_) => None,
            None => Some(MapDownload::new(map.clone())),
        };
        self.map_path = found;
        self.map = Some(map);
    }

    /// Takes the finished download out of the session.
    pub fn take_download(&mut self) -> Option<MapDownload> {
        self.download.take()
    }

    pub fn finish_map(&mut self, path: PathBuf) {
        info!(slot = %self.slot, path = %path.display(), "Map ready");
        self.download = None;
        self.map_path = Some(path);
        self.map_ready = true;
        self.resource_blocked = false;
    }

    /// Map transfer cannot complete; Loading stays blocked with `err` visible.
    pub fn block_on_resource(&mut self, err: &ClientError) {
        warn!(slot = %self.slot, error = %err, "Map unavailable");
        self.download = None;
        self.map_ready = false;
        self.resource_blocked = true;
        self.last_error = err.to_string();
    }

    pub fn set_con_ready(&mut self) {
        self.con_ready = true;
    }

    /// Map loaded and the server acknowledged; Loading may advance.
    pub fn ready_for_online(&self) -> bool {
        self.state == ClientState::Loading && self.map_ready && self.con_ready
    }

    /// Counts a protocol error. Returns `true` once the tolerance is exceeded.
    pub fn strike(&mut self, err: &ClientError) -> bool {
        self.protocol_strikes += 1;
        warn!(
            slot = %self.slot,
            strikes = self.protocol_strikes,
            error = %err,
            "Protocol error"
        );
        self.last_error = err.to_string();
        self.protocol_strikes > self.protocol_tolerance
    }

    pub fn protocol_strikes(&self) -> u32 {
        self.protocol_strikes
    }

    /// Predicted tick that input should be produced for this frame, if the
    /// game layer was not already asked for it.
    pub fn input_due(&mut self) -> Option<i32> {
        if self.state != ClientState::Online || !self.clock.is_synced() {
            return None;
        }
        let pred = self.clock.pred_tick();
        if pred <= self.input_polled_tick {
            return None;
        }
        self.input_polled_tick = pred;
        Some(pred)
    }

    /// Applies everything `producer` has due at `now`.
    ///
    /// Snapshots older than or equal to the current tick are dropped. A
    /// snapshot that fails to decode counts as a protocol strike; once the
    /// strikes exceed the tolerance the error is returned and the caller
    /// drops the session.
    pub fn pump(
        &mut self,
        producer: &mut dyn SnapshotProducer,
        now: Instant,
        recorder: &mut Option<Box<dyn DemoSink>>,
    ) -> ClientResult<PumpOutcome> {
        let mut out = PumpOutcome::default();
        while let Some(item) = producer.poll_next(now) {
            match item {
                Produced::Snapshot { tick, data } => {
                    if !is_valid_tick(tick) {
                        let err = ClientError::protocol(format!("snapshot tick {tick} out of range"));
                        if self.strike(&err) {
                            return Err(err);
                        }
                        continue;
                    }
                    if !self.clock.accepts(tick) {
                        debug!(
                            slot = %self.slot,
                            tick,
                            current = self.clock.cur_tick(),
                            "Dropping late snapshot"
                        );
                        out.stale += 1;
                        continue;
                    }
                    match self.store.decode_snapshot(tick, &data) {
                        Ok(report) => {
                            self.clock.on_tick(tick, now);
                            if report.dropped > 0 {
                                let err = ClientError::protocol(format!(
                                    "snapshot {tick}: dropped {} duplicate items",
                                    report.dropped
                                ));
                                if self.strike(&err) {
                                    return Err(err);
                                }
                            } else {
                                self.protocol_strikes = 0;
                            }
                            if let Some(rec) = recorder.as_mut() {
                                rec.record_snapshot(tick, self.store.snapshot(SnapSelector::Current));
                            }
                            out.applied.push(tick);
                        }
                        Err(err) => {
                            if self.strike(&err) {
                                return Err(err);
                            }
                        }
                    }
                }
                Produced::Message(packet) => out.messages.push(packet),
            }
        }
        out.finished = producer.is_finished();
        self.clock.update(now);
        Ok(out)
    }

    /// `pump` over the snapshots received from the network.
    pub fn pump_network(
        &mut self,
        now: Instant,
        recorder: &mut Option<Box<dyn DemoSink>>,
    ) -> ClientResult<PumpOutcome> {
        let mut queue = mem::take(&mut self.queue);
        let result = self.pump(&mut queue, now, recorder);
        queue.clear();
        self.queue = queue;
        result
    }
}

/// The main and dummy sessions.
#[derive(Debug)]
pub struct SessionPair {
    pub main: Session,
    pub dummy: Session,
}

impl SessionPair {
    pub fn new(cfg: &EngineConfig, now: Instant) -> Self {
        Self {
            main: Session::new(ClientSlot::Main, cfg, now),
            dummy: Session::new(ClientSlot::Dummy, cfg, now),
        }
    }

    pub fn get(&self, slot: ClientSlot) -> &Session {
        match slot {
            ClientSlot::Main => &self.main,
            ClientSlot::Dummy => &self.dummy,
        }
    }

    pub fn get_mut(&mut self, slot: ClientSlot) -> &mut Session {
        match slot {
            ClientSlot::Main => &mut self.main,
            ClientSlot::Dummy => &mut self.dummy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHooks;

    fn session() -> (Session, Instant) {
        let now = Instant::now();
        (Session::new(ClientSlot::Main, &EngineConfig::default(), now), now)
    }

    fn online(s: &mut Session, now: Instant) {
        let hooks: &mut dyn GameHooks = &mut NoopHooks;
        s.begin_connect("127.0.0.1:8303", now, hooks).unwrap();
        s.set_state(ClientState::Loading, now, hooks).unwrap();
        s.set_state(ClientState::Online, now, hooks).unwrap();
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let (mut s, now) = session();
        let err = s.set_state(ClientState::Online, now, &mut NoopHooks).unwrap_err();
        assert_eq!(
            err,
            ClientError::InvalidTransition {
                from: "offline",
                to: "online"
            }
        );
        assert_eq!(s.state(), ClientState::Offline);
    }

    #[test]
    fn duplicate_tick_is_dropped() {
        let (mut s, now) = session();
        online(&mut s, now);
        s.queue_mut().push(5, vec![]);
        s.queue_mut().push(5, vec![]);
        s.queue_mut().push(4, vec![]);
        let out = s.pump_network(now, &mut None).unwrap();
        assert_eq!(out.applied, vec![5]);
        assert_eq!(out.stale, 2);
        assert_eq!(s.clock().cur_tick(), 5);
    }

    #[test]
    fn out_of_range_ticks_are_strikes() {
        let (mut s, now) = session();
        online(&mut s, now);
        s.queue_mut().push(-100, vec![]);
        s.queue_mut().push(i32::MAX, vec![]);
        let out = s.pump_network(now, &mut None).unwrap();
        assert!(out.applied.is_empty());
        assert_eq!(s.protocol_strikes(), 2);
        assert_eq!(s.clock().cur_tick(), -1);

        s.queue_mut().push(40, vec![]);
        let out = s.pump_network(now, &mut None).unwrap();
        assert_eq!(out.applied, vec![40]);
        assert_eq!(s.protocol_strikes(), 0);
    }

    #[test]
    fn repeated_decode_errors_exceed_tolerance() {
        let (mut s, now) = session();
        online(&mut s, now);
        let tolerance = EngineConfig::default().protocol_error_tolerance;
        for tick in 0..tolerance as i32 {
            s.queue_mut().push(tick, vec![0xff]);
            assert!(s.pump_network(now, &mut None).is_ok());
        }
        s.queue_mut().push(100, vec![0xff]);
        assert!(s.pump_network(now, &mut None).is_err());
    }

    #[test]
    fn cancel_clears_everything() {
        let (mut s, now) = session();
        online(&mut s, now);
        s.queue_mut().push(1, vec![]);
        s.pump_network(now, &mut None).unwrap();
        s.start_map(
            MapDescriptor {
                name: "dm1".into(),
                sha256: String::new(),
                size: 10,
            },
            None,
        );
        assert!(s.map_progress().is_some());

        s.cancel("bye", now, &mut NoopHooks).unwrap();
        assert_eq!(s.state(), ClientState::Offline);
        assert_eq!(s.store().count(SnapSelector::Current), 0);
        assert_eq!(s.store().count(SnapSelector::Prev), 0);
        assert!(s.map_progress().is_none());
        assert_eq!(s.clock().cur_tick(), -1);
        assert_eq!(s.error_string(), "bye");

        // Already offline: still fine.
        s.cancel("again", now, &mut NoopHooks).unwrap();
    }

    #[test]
    fn quitting_session_ignores_cancel() {
        let (mut s, now) = session();
        s.quit(now, &mut NoopHooks).unwrap();
        s.cancel("late", now, &mut NoopHooks).unwrap();
        assert_eq!(s.state(), ClientState::Quitting);
        assert!(s.begin_connect("x:1", now, &mut NoopHooks).is_err());
    }
}
