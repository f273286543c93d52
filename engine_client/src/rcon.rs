//! Remote console session state.

use std::collections::BTreeMap;

/// A command the server exposes over rcon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconCommand {
    pub name: String,
    pub help: String,
    pub params: String,
}

/// Per-session rcon flags, changed only by the server's auth exchange.
#[derive(Debug, Clone, Default)]
pub struct RconState {
    authed: bool,
    use_temp_commands: bool,
    commands: BTreeMap<String, RconCommand>,
}

impl RconState {
    pub fn authed(&self) -> bool {
        self.authed
    }

    pub fn uses_temporary_commands(&self) -> bool {
        self.use_temp_commands
    }

    pub fn apply_auth_status(&mut self, authed: bool, cmdlist: bool) {
        self.authed = authed;
        self.use_temp_commands = authed && cmdlist;
        if !authed {
            self.commands.clear();
        }
    }

    pub fn add_command(&mut self, cmd: RconCommand) {
        self.commands.insert(cmd.name.clone(), cmd);
    }

    pub fn remove_command(&mut self, name: &str) -> bool {
        self.commands.remove(name).is_some()
    }

    /// Server commands, sorted by name.
    pub fn commands(&self) -> impl Iterator<Item = &RconCommand> {
        self.commands.values()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deauth_drops_command_list() {
        let mut rcon = RconState::default();
        rcon.apply_auth_status(true, true);
        rcon.add_command(RconCommand {
            name: "kick".into(),
            help: "Kick a player".into(),
            params: "i".into(),
        });
        assert!(rcon.uses_temporary_commands());
        assert_eq!(rcon.commands().count(), 1);

        rcon.apply_auth_status(false, true);
        assert!(!rcon.authed());
        assert!(!rcon.uses_temporary_commands());
        assert_eq!(rcon.commands().count(), 0);
    }

    #[test]
    fn remove_unknown_command_is_harmless() {
        let mut rcon = RconState::default();
        assert!(!rcon.remove_command("nope"));
    }
}
