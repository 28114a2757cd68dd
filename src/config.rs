use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest frame either side accepts (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How the agent starts its PowerShell interpreter.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Interpreter executable (looked up on `PATH` if not absolute)
    pub program: PathBuf,
    /// Arguments passed before the wrapper script
    pub args: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pwsh"),
            args: vec![
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
            ],
        }
    }
}

impl HostConfig {
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Jobs executing at once; further dispatches wait for a slot.
    pub max_concurrent_jobs: usize,
    pub max_frame_bytes: usize,
    pub host: HostConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 47100)),
            max_concurrent_jobs: 8,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            host: HostConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_host(mut self, host: HostConfig) -> Self {
        self.host = host;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Agent address in host:port form
    pub addr: String,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:47100".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
