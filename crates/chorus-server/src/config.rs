//! Daemon configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Runtime configuration for the daemon. Loaded from a JSON file when one
/// is given, otherwise defaulted; the CLI may override single fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the control socket and per-stream audio sockets.
    pub sock_dir: PathBuf,
    /// Directory holding shared-memory files (stream areas, server state).
    pub shm_dir: PathBuf,
    /// Group given access to the socket directory, when set.
    pub audio_gid: Option<u32>,
    /// DSP configuration file consumed by the reload handler.
    pub dsp_config: Option<PathBuf>,
    /// Budget for a client to finish its connection handshake.
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let sock_dir = PathBuf::from("/run/chorus");
        Self {
            shm_dir: sock_dir.join("shm"),
            sock_dir,
            audio_gid: None,
            dsp_config: None,
            connect_timeout_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ServerError::Fatal(format!("bad config {}: {e}", path.display())))
    }

    /// Configuration rooted at a private runtime directory, for tests and
    /// unprivileged runs.
    pub fn with_runtime_dir(dir: &Path) -> Self {
        Self {
            sock_dir: dir.to_path_buf(),
            shm_dir: dir.join("shm"),
            ..Self::default()
        }
    }

    pub fn server_socket_path(&self) -> PathBuf {
        self.sock_dir.join(chorus_proto::SERVER_SOCKET_NAME)
    }
}
