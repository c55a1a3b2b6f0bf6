//! Tool invocation value object.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One external command: executable, argument vector and the environment
/// it depends on.
///
/// Invocations are plain values. They hold paths as strings and have no
/// ownership relation to the files those paths name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Executable name, resolved through `PATH`.
    pub program: String,
    /// Arguments in order.
    pub args: Vec<String>,
    /// Variables the tool expects, overlaid on the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ToolInvocation {
    /// Creates an invocation with no arguments and an empty environment.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let rendered = path.as_ref().to_string_lossy().into_owned();
        self.arg(rendered)
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replaces the declared environment.
    pub fn with_envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Renders the command line for logs.
    pub fn display_command(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                parts.push(format!("'{}'", arg));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

impl std::fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_command())
    }
}
