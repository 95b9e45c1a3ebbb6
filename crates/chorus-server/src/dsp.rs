//! DSP configuration hooks.
//!
//! The daemon does not run DSP graphs itself; it loads the configuration
//! for reload/dump requests and hands the hook points to whichever output
//! path cares. Parsing stays deliberately shallow.

use std::path::PathBuf;

use tracing::{info, warn};

pub struct DspManager {
    config_path: Option<PathBuf>,
    contents: Option<String>,
}

impl DspManager {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        let mut manager = Self {
            config_path,
            contents: None,
        };
        manager.reload();
        manager
    }

    /// Re-read the configuration file. Missing or unreadable files leave
    /// the previous configuration in place.
    pub fn reload(&mut self) {
        let Some(path) = self.config_path.as_ref() else {
            return;
        };
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!(path = %path.display(), bytes = text.len(), "dsp config loaded");
                self.contents = Some(text);
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "dsp config reload failed");
            },
        }
    }

    /// Human-readable dump for the `DumpDsp` request.
    pub fn dump(&self) -> String {
        match (&self.config_path, &self.contents) {
            (Some(path), Some(text)) => {
                format!("dsp config {} ({} bytes)\n{text}", path.display(), text.len())
            },
            (Some(path), None) => format!("dsp config {} (not loaded)", path.display()),
            (None, _) => "no dsp config".to_string(),
        }
    }
}
