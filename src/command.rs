//! Declarative command table.
//!
//! Every external tool invocation is described as data: a program, its
//! arguments, whether it needs elevation, and how its output is handled.
//! Nothing is routed through a shell, so monikers and version tags are
//! passed to the tool verbatim as single arguments.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// How a command's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Capture stdout and stderr; stdout is echoed after success.
    Capture,
    /// Capture stdout and stderr without echoing; the caller consumes stdout.
    Quiet,
    /// Attach to the terminal (long builds, log following).
    Inherit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub elevated: bool,
    pub output: OutputMode,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            elevated: false,
            output: OutputMode::Capture,
            current_dir: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Render the command line as an operator would type it.
    pub fn render(&self, use_sudo: bool) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        if self.elevated && use_sudo {
            parts.push("sudo".to_string());
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        let line = parts.join(" ");
        match &self.current_dir {
            Some(dir) => format!("(cd {} && {line})", quote(&dir.display().to_string())),
            None => line,
        }
    }
}

/// A single command or a producer piped into a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Single(CommandSpec),
    Pipe {
        producer: CommandSpec,
        consumer: CommandSpec,
    },
}

impl Invocation {
    pub fn pipe(producer: CommandSpec, consumer: CommandSpec) -> Self {
        Invocation::Pipe { producer, consumer }
    }

    pub fn render(&self, use_sudo: bool) -> String {
        match self {
            Invocation::Single(spec) => spec.render(use_sudo),
            Invocation::Pipe { producer, consumer } => {
                format!("{} | {}", producer.render(use_sudo), consumer.render(use_sudo))
            }
        }
    }

    /// Output mode of the stage whose output the caller sees.
    pub fn output_mode(&self) -> OutputMode {
        match self {
            Invocation::Single(spec) => spec.output,
            Invocation::Pipe { consumer, .. } => consumer.output,
        }
    }
}

impl From<CommandSpec> for Invocation {
    fn from(spec: CommandSpec) -> Self {
        Invocation::Single(spec)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
}

/// The single failure kind of the runner: an action did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("`{command}` failed: {reason}")]
pub struct CommandFailure {
    pub command: String,
    pub reason: String,
    pub output: String,
}

impl CommandFailure {
    pub fn new(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reason: reason.into(),
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | ',' | '+')
        });
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
