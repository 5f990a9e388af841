//! Bridge configuration.
//!
//! Every struct has working defaults and deserializes with
//! `#[serde(default)]`, so a JSON file only needs the keys it overrides:
//!
//! ```json
//! { "proxy_path": "/api/lsp", "worker": { "program": "rust-analyzer", "args": [] } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::protocol::{HeaderPolicy, DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_MAX_FRAMES_PER_TICK};

/// Default upgrade path claimed by the acceptor.
pub const DEFAULT_PROXY_PATH: &str = "/api/copilot";

/// Default listen address used by the demo server.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

/// Characters the router reads as captures or wildcards.
const ROUTE_SYNTAX_CHARS: [char; 4] = [':', '*', '{', '}'];

/// Upper bound for `max_content_length`; no buffer can grow past it.
pub const MAX_CONTENT_LENGTH_LIMIT: usize = isize::MAX as usize;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Socket address the hosting server binds.
    pub listen_addr: String,
    /// Upgrade path handled by the proxy; other paths are left alone.
    pub proxy_path: String,
    /// Worker process spawned for every accepted connection.
    pub worker: WorkerCommand,
    /// Framing limits shared by both readers of a session.
    pub framing: FramingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
            worker: WorkerCommand::default(),
            framing: FramingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load a configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Io` if the file cannot be read,
    /// `BridgeError::Json` if it is not valid JSON for this shape, and
    /// `BridgeError::Config` if validation fails.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the upgrade path.
    pub fn proxy_path(mut self, path: impl Into<String>) -> Self {
        self.proxy_path = path.into();
        self
    }

    /// Set the worker program and its arguments.
    pub fn worker<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker.program = program.into();
        self.worker.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the framing limits.
    pub fn framing(mut self, framing: FramingConfig) -> Self {
        self.framing = framing;
        self
    }

    /// Check invariants the rest of the crate relies on.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if !self.proxy_path.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "proxy_path must start with '/': {:?}",
                self.proxy_path
            )));
        }
        if let Some(c) = self
            .proxy_path
            .chars()
            .find(|c| ROUTE_SYNTAX_CHARS.contains(c))
        {
            return Err(BridgeError::Config(format!(
                "proxy_path must be a literal path, found {c:?}: {:?}",
                self.proxy_path
            )));
        }
        if self.worker.program.trim().is_empty() {
            return Err(BridgeError::Config("worker.program is empty".to_string()));
        }
        self.framing.validate()
    }
}

/// Command line of the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments selecting the worker's framed stdio mode.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory; inherits the host's when unset.
    pub cwd: Option<PathBuf>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "copilot".to_string(),
            args: vec!["--server".to_string(), "--stdio".to_string()],
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

impl WorkerCommand {
    /// Create a command with no extra environment.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

/// Limits applied by every incremental reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Decode steps per scheduling tick before the reader yields.
    pub max_frames_per_tick: usize,
    /// Largest accepted `Content-Length`.
    pub max_content_length: usize,
    /// Handling of header blocks without a usable `Content-Length`.
    pub header_policy: HeaderPolicy,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_frames_per_tick: DEFAULT_MAX_FRAMES_PER_TICK,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            header_policy: HeaderPolicy::default(),
        }
    }
}

impl FramingConfig {
    fn validate(&self) -> Result<()> {
        if self.max_frames_per_tick == 0 {
            return Err(BridgeError::Config(
                "framing.max_frames_per_tick must be at least 1".to_string(),
            ));
        }
        if self.max_content_length == 0 || self.max_content_length > MAX_CONTENT_LENGTH_LIMIT {
            return Err(BridgeError::Config(format!(
                "framing.max_content_length must be between 1 and {MAX_CONTENT_LENGTH_LIMIT}, got {}",
                self.max_content_length
            )));
        }
        Ok(())
    }
}
