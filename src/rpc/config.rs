//! Server launch configuration and transport tuning.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Program launched when `RPC_SERVER_PATH` is not set (resolved via `PATH`).
pub const DEFAULT_SERVER_PROGRAM: &str = "deltachat-rpc-server";

/// Environment variable overriding the server program.
pub const SERVER_PATH_ENV: &str = "RPC_SERVER_PATH";

/// Environment variable through which the server learns its accounts directory.
pub const ACCOUNTS_PATH_ENV: &str = "DC_ACCOUNTS_PATH";

/// Method polled by the event router.
pub const DEFAULT_EVENT_METHOD: &str = "get_next_event";

/// Method called during shutdown to make the server stop background I/O.
pub const DEFAULT_STOP_IO_METHOD: &str = "stop_io_for_all_accounts";

/// Default bound for each shutdown step in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Resolve the default accounts directory.
///
/// Resolution order:
/// 1. `$XDG_DATA_HOME/rpc-transport/accounts` (Linux standard)
/// 2. Platform data dir, e.g. `~/Library/Application Support/rpc-transport/accounts` (macOS)
/// 3. `./accounts` (fallback)
pub fn default_accounts_dir() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        if !data_home.is_empty() {
            return PathBuf::from(data_home).join("rpc-transport").join("accounts");
        }
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("rpc-transport").join("accounts");
    }

    PathBuf::from("accounts")
}

/// Tuning for the transport core, independent of how the server is started.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Zero-argument method that blocks until the next event exists.
    pub event_method: String,
    /// Best-effort call issued first during shutdown; `None` skips it.
    pub stop_io_method: Option<String>,
    /// Bound applied to every shutdown step.
    pub shutdown_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            event_method: DEFAULT_EVENT_METHOD.to_string(),
            stop_io_method: Some(DEFAULT_STOP_IO_METHOD.to_string()),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl TransportOptions {
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_event_method(mut self, method: impl Into<String>) -> Self {
        self.event_method = method.into();
        self
    }

    pub fn with_stop_io_method(mut self, method: Option<String>) -> Self {
        self.stop_io_method = method;
        self
    }
}

/// How to launch the RPC server subprocess.
///
/// # Example
///
/// ```ignore
/// use rpc_transport::{ServerConfig, Transport};
///
/// let config = ServerConfig::from_env().with_arg("--verbose");
/// let transport = Transport::spawn(&config)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Exported to the server as `accounts_env`.
    pub accounts_dir: PathBuf,
    pub accounts_env: String,
    /// Extra environment variables for the server.
    pub envs: Vec<(OsString, OsString)>,
    /// Pass the server's stderr through; otherwise it is discarded.
    pub inherit_stderr: bool,
    pub transport: TransportOptions,
}

impl ServerConfig {
    pub fn new(program: impl Into<PathBuf>, accounts_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            accounts_dir: accounts_dir.into(),
            accounts_env: ACCOUNTS_PATH_ENV.to_string(),
            envs: Vec::new(),
            inherit_stderr: true,
            transport: TransportOptions::default(),
        }
    }

    /// Build a configuration from the environment.
    ///
    /// - program: `$RPC_SERVER_PATH`, else `deltachat-rpc-server`
    /// - accounts directory: `$DC_ACCOUNTS_PATH`, else [`default_accounts_dir`]
    pub fn from_env() -> Self {
        let program = std::env::var_os(SERVER_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_PROGRAM));

        let accounts_dir = std::env::var_os(ACCOUNTS_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_accounts_dir);

        Self::new(program, accounts_dir)
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_accounts_env(mut self, name: impl Into<String>) -> Self {
        self.accounts_env = name.into();
        self
    }

    pub fn with_inherit_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }

    pub fn with_transport_options(mut self, options: TransportOptions) -> Self {
        self.transport = options;
        self
    }
}
