//! `engine_client`
//!
//! Network and session core of the game client:
//! - Connection state machine for the main and dummy sessions
//! - Double-buffered snapshot store with a static item size table
//! - Tick clock, interpolation and prediction timing
//! - Map lookup and download, remote console
//! - Demo recording and playback through the same snapshot path

pub mod client;
pub mod commands;
pub mod demo;
pub mod hooks;
pub mod input;
pub mod interp;
pub mod map;
pub mod producer;
pub mod rcon;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

pub use client::GameClient;
