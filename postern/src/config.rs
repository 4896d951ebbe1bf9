//! The configuration file.
//!
//! ```ron
//! (
//!     me: Some("mx.example.org"),
//!     listeners: [
//!         (socket: "[::]:25", relay_clients: ["127.0.0.1"]),
//!     ],
//!     smtp: ( databytes: 26214400 ),
//!     spool: ( directory: "/var/spool/postern/tmp" ),
//!     plugins: ( enabled: ["deny_logger", "delivery_logger"] ),
//!     outbound: ( queue_dir: "/var/spool/postern/queue" ),
//! )
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use postern_delivery::OutboundConfig;
use postern_plugins::PluginConfig;
use postern_smtp::{ListenerConfig, SmtpConfig};
use postern_spool::SpoolConfig;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "POSTERN_CONFIG";

const SEARCH_PATHS: [&str; 2] = ["./postern.config.ron", "/etc/postern/postern.config.ron"];

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Host name used in greetings, EHLO and queue file names.
    #[serde(default)]
    pub me: Option<String>,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub spool: SpoolConfig,

    #[serde(default)]
    pub plugins: PluginConfig,

    #[serde(default)]
    pub outbound: OutboundConfig,
}

impl Config {
    pub fn from_ron(source: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(source)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_ron(&source).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// The configured host name, else `$HOSTNAME`, else `localhost`.
    #[must_use]
    pub fn me(&self) -> Arc<str> {
        self.me
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
            .into()
    }
}

/// Find the configuration file.
///
/// An explicit path wins, then [`CONFIG_ENV`], then `./postern.config.ron`,
/// then `/etc/postern/postern.config.ron`.
pub fn locate(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    locate_in(explicit, std::env::var_os(CONFIG_ENV).map(PathBuf::from), &SEARCH_PATHS)
}

fn locate_in(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    search: &[&str],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "Config file {} does not exist", path.display());
        return Ok(path);
    }

    if let Some(path) = from_env {
        anyhow::ensure!(
            path.exists(),
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
        return Ok(path);
    }

    if let Some(path) = search.iter().map(PathBuf::from).find(|path| path.exists()) {
        return Ok(path);
    }

    let tried = search
        .iter()
        .map(|path| format!("  - {path}"))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::bail!("No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{tried}")
}
