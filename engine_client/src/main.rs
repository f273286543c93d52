//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--config client.json] [--addr 127.0.0.1:8303] [--name player]
//!
//! Drives the client once per tick and reads console commands from stdin
//! (`connect`, `disconnect`, `dummy_connect`, `dummy_swap`, `rcon_auth`,
//! `rcon`, `record`, `stoprecord`, `play`, `status`, `quit`).

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use engine_client::{
    hooks::GameHooks, state::ClientState, transport::UdpTransport, GameClient,
};
use engine_shared::{config::EngineConfig, net::ClientSlot};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Logs lifecycle events and prints remote console output.
struct ConsoleHooks;

impl GameHooks for ConsoleHooks {
    fn on_state_change(&mut self, slot: ClientSlot, new: ClientState, old: ClientState) {
        info!(slot = %slot, from = %old, to = %new, "State change");
    }

    fn on_new_snapshot(&mut self, slot: ClientSlot, tick: i32) {
        if tick % 250 == 0 {
            info!(slot = %slot, tick, "Snapshot");
        }
    }

    fn on_rcon_line(&mut self, _slot: ClientSlot, line: &str) {
        println!("[rcon] {line}");
    }

    fn on_dummy_disconnect(&mut self, reason: &str) {
        println!("Dummy disconnected: {reason}");
    }
}

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            EngineConfig::from_json_file(Path::new(path))?
        }
        None => EngineConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--maps-dir" if i + 1 < args.len() => {
                cfg.maps_dir = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                cfg.password = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, maps_dir = %cfg.maps_dir, "Starting client");

    let tick_duration = cfg.tick_duration();
    let auto_connect = (!cfg.server_addr.is_empty()).then(|| cfg.server_addr.clone());
    let mut client = GameClient::new(
        cfg,
        Box::new(UdpTransport::default()),
        Box::new(ConsoleHooks),
        Instant::now(),
    );
    if let Some(addr) = auto_connect {
        client.connect(&addr).context("connect")?;
    }

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Type 'status' for info, 'quit' to exit.");

    let mut interval = tokio::time::interval(tick_duration);
    loop {
        interval.tick().await;

        while let Ok(line) = console_rx.try_recv() {
            match client.exec(&line) {
                Ok(output) => output.iter().for_each(|l| println!("{l}")),
                Err(e) => println!("Error: {e}"),
            }
        }

        if client.is_quitting() {
            break;
        }
        if let Err(e) = client.update(Instant::now()) {
            println!("Update error: {e}");
        }
    }

    client.demo_recorder_stop();
    match client.flush_demos().await {
        Ok(0) => {}
        Ok(frames) => info!(frames, "Demo recording flushed"),
        Err(e) => warn!(error = %e, "Demo recording incomplete"),
    }

    info!("Client stopped");
    Ok(())
}
