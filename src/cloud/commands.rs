use crate::error::CommandError;
use anyhow::{Context, Result};
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::{path::Path, sync::Mutex};

// finished commands kept for status queries, oldest dropped first
const MAX_FINISHED_COMMANDS: usize = 100;
const FINGERPRINT_BYTES: usize = 8;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandState {
    Queued,
    InProgress,
    Done,
    Cancelled,
}

impl CommandState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::InProgress => "inProgress",
            CommandState::Done => "done",
            CommandState::Cancelled => "cancelled",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, CommandState::Done | CommandState::Cancelled)
    }

    /// Lifecycle only moves forward; `inProgress` may repeat for progress updates.
    pub fn can_transition_to(self, next: CommandState) -> bool {
        match (self, next) {
            (CommandState::Queued, CommandState::Queued) => false,
            (CommandState::Queued, _) => true,
            (CommandState::InProgress, CommandState::Queued) => false,
            (CommandState::InProgress, _) => true,
            (CommandState::Done | CommandState::Cancelled, _) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub name: String,
    pub parameters: Value,
    pub state: CommandState,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub progress: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub results: Value,
}

impl Command {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
            state: CommandState::Queued,
            progress: Value::Null,
            results: Value::Null,
        }
    }

    /// Reads a command as delivered by the cloud queue; the state always starts at `queued`.
    pub fn from_json(value: &Value) -> Result<Self, CommandError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CommandError::NotFound("command without id".to_string()))?;
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::UnknownDefinition(format!("command {id} has no name")))?;
        let parameters = value
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));

        Ok(Self::new(id, name, parameters))
    }

    pub fn transition(&mut self, next: CommandState, payload: Value) -> Result<(), CommandError> {
        if !self.state.can_transition_to(next) {
            return Err(CommandError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        match next {
            CommandState::InProgress => self.progress = payload,
            CommandState::Done => self.results = payload,
            CommandState::Queued | CommandState::Cancelled => {}
        }
        self.state = next;

        Ok(())
    }
}

/// Owner of command definitions and instances
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandManager: Send + Sync {
    /// Definitions in `{"<package>": {"<command>": {...}}}` form
    fn command_defs(&self) -> Value;
    fn fingerprint(&self) -> String;
    fn add_command(&self, command: Command) -> Result<(), CommandError>;
    fn find_command(&self, id: &str) -> Option<Command>;
    fn list_commands(&self) -> Vec<Command>;
    fn update_command(
        &self,
        id: &str,
        state: CommandState,
        payload: Value,
    ) -> Result<Command, CommandError>;
}

/// In-memory command queue
pub struct LocalCommandQueue {
    definitions: Map<String, Value>,
    fingerprint: String,
    commands: Mutex<Vec<Command>>,
}

/// Short hex digest of the serialized definitions
fn definitions_fingerprint(definitions: &Map<String, Value>) -> String {
    let digest = Sha256::digest(Value::Object(definitions.clone()).to_string().as_bytes());
    digest[..FINGERPRINT_BYTES]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Drops the oldest finished commands beyond [`MAX_FINISHED_COMMANDS`]
fn prune_finished(commands: &mut Vec<Command>) {
    let finished = commands.iter().filter(|c| c.state.is_final()).count();
    let mut excess = finished.saturating_sub(MAX_FINISHED_COMMANDS);
    if excess == 0 {
        return;
    }

    commands.retain(|command| {
        if excess > 0 && command.state.is_final() {
            excess -= 1;
            debug!("dropping finished command {}", command.id);
            false
        } else {
            true
        }
    });
}

impl LocalCommandQueue {
    pub fn new(definitions: Map<String, Value>) -> Self {
        Self {
            fingerprint: definitions_fingerprint(&definitions),
            definitions,
            commands: Mutex::new(vec![]),
        }
    }

    /// Loads definitions from a JSON file; a missing file yields no definitions.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.try_exists().unwrap_or(false) {
            info!("no command definitions at {path:?}");
            return Ok(Self::new(Map::new()));
        }

        let content = std::fs::read_to_string(path)
            .context(format!("failed to read command definitions: {path:?}"))?;
        let definitions = serde_json::from_str(&content)
            .context(format!("failed to parse command definitions: {path:?}"))?;

        Ok(Self::new(definitions))
    }

    fn is_defined(&self, name: &str) -> bool {
        name.split_once('.')
            .and_then(|(package, command)| self.definitions.get(package)?.get(command))
            .is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Command>> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CommandManager for LocalCommandQueue {
    fn command_defs(&self) -> Value {
        Value::Object(self.definitions.clone())
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn add_command(&self, command: Command) -> Result<(), CommandError> {
        if !self.is_defined(&command.name) {
            return Err(CommandError::UnknownDefinition(command.name));
        }

        let mut commands = self.lock();
        if commands.iter().any(|c| c.id == command.id) {
            debug!("command {} already queued", command.id);
            return Ok(());
        }

        info!("queued command {} ({})", command.id, command.name);
        commands.push(command);
        Ok(())
    }

    fn find_command(&self, id: &str) -> Option<Command> {
        self.lock().iter().find(|c| c.id == id).cloned()
    }

    fn list_commands(&self) -> Vec<Command> {
        self.lock().clone()
    }

    fn update_command(
        &self,
        id: &str,
        state: CommandState,
        payload: Value,
    ) -> Result<Command, CommandError> {
        let mut commands = self.lock();
        let command = commands
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

        command.transition(state, payload)?;
        debug!("command {id} is {}", state.as_str());
        let command = command.clone();

        if state.is_final() {
            prune_finished(&mut commands);
        }

        Ok(command)
    }
}
