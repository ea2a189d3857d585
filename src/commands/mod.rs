// src/commands/mod.rs

//! What a job runs.
//!
//! A [`Commands`] value is a sequence of [`Command`]s, each a list of
//! argument components. A component may be the output of another command,
//! read through a named pipe; the producing command is owned by the one
//! reading it, so a command graph cannot contain a loop.

pub mod context;
pub mod script;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use context::CommandContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandComponent {
    Literal {
        value: String,
    },
    /// A path on the job's host.
    Path {
        path: PathBuf,
    },
    /// Content written to an auxiliary file; the argument is that file.
    ParameterFile {
        key: String,
        content: String,
    },
    WorkingDirectory,
    /// Output of another command.
    Pipe {
        command: Box<Command>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub components: Vec<CommandComponent>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(Self::new(), |cmd, a| cmd.arg(a))
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.components.push(CommandComponent::Literal {
            value: value.into(),
        });
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.components
            .push(CommandComponent::Path { path: path.into() });
        self
    }

    pub fn parameter_file(mut self, key: impl Into<String>, content: impl Into<String>) -> Self {
        self.components.push(CommandComponent::ParameterFile {
            key: key.into(),
            content: content.into(),
        });
        self
    }

    pub fn working_directory(mut self) -> Self {
        self.components.push(CommandComponent::WorkingDirectory);
        self
    }

    pub fn pipe(mut self, command: Command) -> Self {
        self.components.push(CommandComponent::Pipe {
            command: Box::new(command),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Commands whose output this one reads, directly or not.
    pub fn producers(&self) -> Vec<&Command> {
        let mut out = Vec::new();
        for component in &self.components {
            if let CommandComponent::Pipe { command } = component {
                out.extend(command.producers());
                out.push(command.as_ref());
            }
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match component {
                CommandComponent::Literal { value } => f.write_str(value)?,
                CommandComponent::Path { path } => write!(f, "{}", path.display())?,
                CommandComponent::ParameterFile { key, .. } => write!(f, "@{}", key)?,
                CommandComponent::WorkingDirectory => f.write_str("$PWD")?,
                CommandComponent::Pipe { command } => write!(f, "<({})", command)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commands {
    pub commands: Vec<Command>,
}

impl Commands {
    pub fn single(command: Command) -> Self {
        Self {
            commands: vec![command],
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.iter().all(Command::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}

impl fmt::Display for Commands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, command) in self.commands.iter().enumerate() {
            if i > 0 {
                f.write_str(" ; ")?;
            }
            write!(f, "{}", command)?;
        }
        Ok(())
    }
}
