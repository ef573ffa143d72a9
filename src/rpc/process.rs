//! RPC server subprocess: spawning and reaping.
//!
//! # Process Cleanup Safety
//!
//! `ServerProcess` owns the child handle. Shutdown closes the server's stdin
//! and then reaps it with a bounded wait, killing it if it does not exit in
//! time. If the handle is dropped without being reaped (e.g. startup failed
//! half-way), `Drop` kills and waits so no orphaned server is left behind.

use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::rpc::config::ServerConfig;
use crate::rpc::error::RpcError;

/// Interval between `try_wait` polls while waiting for the server to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The spawned server plus the pipes handed to the transport loops.
pub(crate) struct SpawnedServer {
    pub(crate) process: ServerProcess,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
}

/// Spawn the RPC server with piped stdin/stdout and the accounts directory
/// exported through the configured environment variable.
pub(crate) fn spawn_server(config: &ServerConfig) -> Result<SpawnedServer, RpcError> {
    let program = config.program.display().to_string();
    info!(
        "Starting RPC server: {} ({}={})",
        program,
        config.accounts_env,
        config.accounts_dir.display()
    );

    let stderr = if config.inherit_stderr {
        Stdio::inherit()
    } else {
        Stdio::null()
    };

    let mut child = Command::new(&config.program)
        .args(&config.args)
        .env(&config.accounts_env, &config.accounts_dir)
        .envs(config.envs.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .spawn()
        .map_err(|source| RpcError::Spawn {
            program: program.clone(),
            source,
        })?;

    // Create the owner first so a missing pipe still reaps the child.
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let process = ServerProcess {
        child,
        program,
        reaped: false,
    };

    let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
        return Err(RpcError::Transport(
            "Failed to get stdio handles for RPC server".to_string(),
        ));
    };

    debug!("RPC server started with pid {}", process.id());
    Ok(SpawnedServer {
        process,
        stdin,
        stdout,
    })
}

pub(crate) struct ServerProcess {
    child: Child,
    program: String,
    reaped: bool,
}

impl ServerProcess {
    pub(crate) fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait up to `timeout` for the server to exit, then kill it.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ShutdownTimeout` when the server had to be killed,
    /// `RpcError::Io` when waiting on the child fails.
    pub(crate) fn reap(&mut self, timeout: Duration) -> Result<ExitStatus, RpcError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.reaped = true;
                    debug!("RPC server {} exited: {}", self.program, status);
                    return Ok(status);
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => break,
                Err(e) => {
                    warn!("Error waiting for RPC server: {}", e);
                    return Err(RpcError::Io(e));
                }
            }
        }

        warn!(
            "RPC server {} didn't exit within {:?}, killing",
            self.program, timeout
        );
        self.kill();
        Err(RpcError::ShutdownTimeout {
            step: "wait for server exit",
            timeout,
        })
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if !self.reaped {
            debug!("Killing unreaped RPC server {}", self.program);
            self.kill();
        }
    }
}
