//! Startup configuration.
//!
//! Loaded from a json document. Secrets may be overridden by environment
//! variables, after reading a `.env` file if there's one:
//!
//! - `SPOTIFY_CLIENT_ID` and `SPOTIFY_CLIENT_SECRET`;
//! - `VOICELINK_NODE_<NAME>_PASSWORD`, where `<NAME>` is the node key in
//!   upper case with dashes replaced by underscores.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::error::{Result, VoicelinkError};
use crate::node::NodeConfig;
use crate::penalty::LoadWeights;
use crate::queue::QueueConfig;
use crate::track::SearchType;

/// Spotify application credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(missing_docs)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

fn default_stuck_grace_secs() -> u64 {
    10
}

fn default_connect_retries() -> u32 {
    5
}

fn default_history_limit() -> usize {
    25
}

/// Whole configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct VoicelinkConfig {
    /// Nodes by name. Nodes without `identifier` take their key.
    pub nodes: HashMap<String, NodeConfig>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub spotify: Option<SpotifyConfig>,
    /// Search engine used for queries that aren't links.
    #[serde(default)]
    pub default_search: SearchType,
    #[allow(missing_docs)]
    #[serde(default)]
    pub queue: QueueConfig,
    /// Node load score weights.
    #[serde(default)]
    pub weights: LoadWeights,
    /// Seconds to wait before skipping a stuck track.
    #[serde(default = "default_stuck_grace_secs")]
    pub stuck_grace_secs: u64,
    /// Reconnection attempts before giving up on a new node.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Tracks kept in each user's persisted history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl VoicelinkConfig {
    /// Parses and validates a json document. Environment isn't read.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: Self =
            serde_json::from_str(raw).map_err(|e| VoicelinkError::ConfigError(e.to_string()))?;

        for (name, node) in config.nodes.iter_mut() {
            if node.identifier.is_empty() {
                node.identifier = name.clone();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reads the file at `path`, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("loaded environment from {}", env_file.display());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| VoicelinkError::ConfigError(format!("{}: {e}", path.display())))?;

        let mut config = Self::from_json(&raw)?;
        config.apply_env(|key| std::env::var(key).ok());

        info!("loaded config with {} nodes from {}", config.nodes.len(), path.display());
        Ok(config)
    }

    /// Overrides secrets with the values returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let (Some(client_id), Some(client_secret)) =
            (lookup("SPOTIFY_CLIENT_ID"), lookup("SPOTIFY_CLIENT_SECRET"))
        {
            self.spotify = Some(SpotifyConfig { client_id, client_secret });
        }

        for (name, node) in self.nodes.iter_mut() {
            let key = format!(
                "VOICELINK_NODE_{}_PASSWORD",
                name.to_ascii_uppercase().replace('-', "_")
            );
            if let Some(password) = lookup(&key) {
                node.password = password;
            }
        }
    }

    /// Rejects documents the players can't work with.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(VoicelinkError::ConfigError("at least one node is required".to_string()));
        }
        if self.queue.max_size == 0 || self.queue.history_size == 0 {
            return Err(VoicelinkError::ConfigError("queue sizes must be greater than 0".to_string()));
        }

        let LoadWeights { cpu, players_per_core, track_failures } = self.weights;
        if [cpu, players_per_core, track_failures].iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(VoicelinkError::ConfigError("weights must be positive numbers".to_string()));
        }

        Ok(())
    }

    #[allow(missing_docs)]
    pub fn stuck_grace(&self) -> Duration {
        Duration::from_secs(self.stuck_grace_secs)
    }
}
