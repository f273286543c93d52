//! Callbacks into the game layer.
//!
//! The client core never interprets snapshot contents or game messages; it
//! reports lifecycle events through [`GameHooks`] and asks it for input.
//! Every method has a no-op default.

use engine_shared::net::{ClientSlot, Packet};

use crate::state::ClientState;

pub trait GameHooks {
    /// A session changed state. Runs before the transition call returns.
    fn on_state_change(&mut self, _slot: ClientSlot, _new: ClientState, _old: ClientState) {}

    /// A session reached `Online`.
    fn on_connected(&mut self, _slot: ClientSlot) {}

    /// Enter-game was sent and tick state reset.
    fn on_enter_game(&mut self, _slot: ClientSlot) {}

    /// A snapshot for `tick` became the current buffer.
    fn on_new_snapshot(&mut self, _slot: ClientSlot, _tick: i32) {}

    /// A game-layer (non-system) message arrived.
    fn on_message(&mut self, _slot: ClientSlot, _packet: &Packet) {}

    /// Input for the next predicted tick. `force` asks for input even if it
    /// did not change, so the server's input buffer stays populated.
    fn on_snap_input(&mut self, _slot: ClientSlot, _force: bool) -> Option<Vec<i32>> {
        None
    }

    /// The active slot changed.
    fn on_dummy_swap(&mut self, _active: ClientSlot) {}

    /// The dummy session was disconnected.
    fn on_dummy_disconnect(&mut self, _reason: &str) {}

    /// A remote console output line.
    fn on_rcon_line(&mut self, _slot: ClientSlot, _line: &str) {}

    /// The client is quitting.
    fn on_shutdown(&mut self) {}
}

/// Hooks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl GameHooks for NoopHooks {}
