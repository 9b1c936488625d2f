//! Explicit name -> constructor registry for command wrappers.

use std::collections::BTreeMap;

use super::Command;
use crate::error::CmdChainError;
use crate::Result;

/// Produces a fresh [`Command`] for a registered name.
pub type CommandConstructor = fn() -> Command;

/// Maps command names to constructors.
///
/// Registration is validated up front so that [`create`](Self::create)
/// can only fail with [`CmdChainError::CommandNotFound`].
#[derive(Debug, Default, Clone)]
pub struct CommandRegistry {
    constructors: BTreeMap<String, CommandConstructor>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `name`.
    ///
    /// Fails if the name is empty or contains whitespace, if it is already
    /// taken, or if the constructor yields a command with an invalid
    /// program.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: CommandConstructor,
    ) -> Result<()> {
        let name = name.into();

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(CmdChainError::InvalidCommandName {
                name,
                reason: "must be non-empty and contain no whitespace".into(),
            });
        }
        if self.constructors.contains_key(&name) {
            return Err(CmdChainError::DuplicateCommand(name));
        }

        let sample = constructor();
        if let Some(violation) = sample.validate().into_iter().find(|v| v.field == "program") {
            return Err(CmdChainError::InvalidCommandName {
                name,
                reason: violation.to_string(),
            });
        }

        self.constructors.insert(name, constructor);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(
        mut self,
        name: impl Into<String>,
        constructor: CommandConstructor,
    ) -> Result<Self> {
        self.register(name, constructor)?;
        Ok(self)
    }

    /// Construct a fresh command by name.
    pub fn create(&self, name: &str) -> Result<Command> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| CmdChainError::CommandNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}
