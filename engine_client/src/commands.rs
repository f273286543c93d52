//! Console commands for the client binary.
//!
//! Each line is split into quote-aware tokens and mapped onto a
//! [`GameClient`] control operation. Output lines are returned to the caller
//! for printing.

use std::path::Path;

use anyhow::{anyhow, bail};

use crate::client::GameClient;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(String),
    Disconnect,
    Quit,
    DummyConnect,
    DummyDisconnect,
    DummySwap,
    RconAuth { name: String, password: String },
    Rcon(String),
    Play(String),
    Record(String),
    StopRecord,
    DemoPause(bool),
    DemoSpeed(f32),
    TimeoutSeed,
    Status,
}

impl Command {
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let tokens = parse_command_line(line);
        let Some((name, args)) = tokens.split_first() else {
            return Ok(None);
        };
        let arg = |i: usize| -> anyhow::Result<String> {
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow!("{name}: missing argument {}", i + 1))
        };

        let cmd = match name.to_lowercase().as_str() {
            "connect" => Command::Connect(arg(0)?),
            "disconnect" => Command::Disconnect,
            "quit" | "exit" => Command::Quit,
            "dummy_connect" => Command::DummyConnect,
            "dummy_disconnect" => Command::DummyDisconnect,
            "dummy_swap" => Command::DummySwap,
            "rcon_auth" => match args {
                [password] => Command::RconAuth {
                    name: String::new(),
                    password: password.clone(),
                },
                [name, password, ..] => Command::RconAuth {
                    name: name.clone(),
                    password: password.clone(),
                },
                [] => bail!("rcon_auth: missing password"),
            },
            "rcon" => {
                if args.is_empty() {
                    bail!("rcon: missing command");
                }
                Command::Rcon(args.join(" "))
            }
            "play" => Command::Play(arg(0)?),
            "record" => Command::Record(arg(0)?),
            "stoprecord" => Command::StopRecord,
            "demo_pause" => Command::DemoPause(args.first().map_or(true, |v| v != "0")),
            "demo_speed" => Command::DemoSpeed(
                arg(0)?
                    .parse()
                    .map_err(|e| anyhow!("demo_speed: {e}"))?,
            ),
            "timeout_seed" => Command::TimeoutSeed,
            "status" => Command::Status,
            other => bail!("unknown command: {other}"),
        };
        Ok(Some(cmd))
    }
}

impl GameClient {
    /// Parses and runs one console line.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let Some(cmd) = Command::parse(line)? else {
            return Ok(Vec::new());
        };
        self.exec_command(cmd)
    }

    pub fn exec_command(&mut self, cmd: Command) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        match cmd {
            Command::Connect(addr) => {
                self.connect(&addr)?;
                out.push(format!("Connecting to {addr}"));
            }
            Command::Disconnect => self.disconnect()?,
            Command::Quit => self.quit()?,
            Command::DummyConnect => self.dummy_connect()?,
            Command::DummyDisconnect => self.dummy_disconnect("dummy disconnected")?,
            Command::DummySwap => {
                let active = self.dummy_swap()?;
                out.push(format!("Active session: {active}"));
            }
            Command::RconAuth { name, password } => self.rcon_auth(&name, &password)?,
            Command::Rcon(line) => self.rcon(&line)?,
            Command::Play(file) => {
                self.demo_play_file(Path::new(&file))?;
                out.push(format!("Playing {file}"));
            }
            Command::Record(name) => {
                let path = self.demo_recorder_start(&name, false)?;
                out.push(format!("Recording to {}", path.display()));
            }
            Command::StopRecord => self.demo_recorder_stop(),
            Command::DemoPause(paused) => self.demo_pause(paused),
            Command::DemoSpeed(speed) => self.demo_set_speed(speed),
            Command::TimeoutSeed => {
                let seed = self.generate_timeout_seed().to_string();
                out.push(format!("Timeout seed: {seed}"));
            }
            Command::Status => out.extend(self.status_lines()),
        }
        Ok(out)
    }

    fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("State: {}", self.state()),
            format!("Active: {}", self.active_slot()),
            format!("Dummy: {}", self.state_of(engine_shared::net::ClientSlot::Dummy)),
            format!("Tick: {} (pred {})", self.game_tick(), self.pred_game_tick()),
            format!("Recording: {}", self.is_recording()),
        ];
        if let Some(addr) = self.server_address() {
            lines.push(format!("Server: {addr}"));
        }
        if let Some(map) = self.current_map() {
            lines.push(format!("Map: {}", map.name));
        }
        if let Some(progress) = self.map_download_progress() {
            lines.push(format!(
                "Downloading {}: {}/{} bytes",
                progress.name, progress.amount, progress.total
            ));
        }
        if self.connection_problems() {
            lines.push("Connection problems".to_string());
        }
        if !self.error_string().is_empty() {
            lines.push(format!("Last error: {}", self.error_string()));
        }
        lines
    }
}

/// Splits a command line into tokens; double quotes group words.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
