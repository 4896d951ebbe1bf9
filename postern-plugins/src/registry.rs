use std::{fmt, sync::Arc, time::Duration};

use ahash::AHashMap;
use postern_common::internal;
use serde::Deserialize;

use crate::{hook::Hook, plugin::Plugin};

/// Plugin section of the configuration file
///
/// ```ron
/// plugins: (
///     timeout_secs: 30,
///     timeouts: { "slow_scanner": 120 },
///     enabled: ["deny_logger"],
/// )
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct PluginConfig {
    /// Default time a plugin has to answer a hook
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Per-plugin overrides, by plugin name
    #[serde(default)]
    pub timeouts: AHashMap<String, u64>,

    /// Plugins to load, in the order they run
    #[serde(default)]
    pub enabled: Vec<String>,
}

const fn default_timeout() -> u64 {
    30
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            timeouts: AHashMap::new(),
            enabled: Vec::new(),
        }
    }
}

/// Hook name to ordered plugin list. Built once, read-only afterwards.
pub struct HookRegistry {
    hooks: AHashMap<Hook, Vec<Arc<dyn Plugin>>>,
    plugins: Vec<Arc<dyn Plugin>>,
    timeouts: AHashMap<String, Duration>,
    default_timeout: Duration,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::default()
    }

    /// Plugins registered for `hook`, in registration order.
    #[must_use]
    pub fn plugins_for(&self, hook: Hook) -> &[Arc<dyn Plugin>] {
        self.hooks.get(&hook).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn has(&self, hook: Hook) -> bool {
        !self.plugins_for(hook).is_empty()
    }

    /// Plugin override first, then configured override, then the default.
    #[must_use]
    pub fn timeout_for(&self, plugin: &dyn Plugin) -> Duration {
        plugin
            .timeout()
            .or_else(|| self.timeouts.get(plugin.name()).copied())
            .unwrap_or(self.default_timeout)
    }

    /// Capability lines contributed by all plugins.
    #[must_use]
    pub fn capabilities(&self) -> Vec<String> {
        self.plugins.iter().flat_map(|p| p.capabilities()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[derive(Default)]
pub struct HookRegistryBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
    timeouts: AHashMap<String, Duration>,
    default_timeout: Option<Duration>,
}

impl HookRegistryBuilder {
    #[must_use]
    pub fn with_config(mut self, config: &PluginConfig) -> Self {
        self.default_timeout = Some(Duration::from_secs(config.timeout_secs));
        self.timeouts.extend(
            config
                .timeouts
                .iter()
                .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs))),
        );
        self
    }

    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, plugin: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts.insert(plugin.into(), timeout);
        self
    }

    #[must_use]
    pub fn register(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    #[must_use]
    pub fn build(self) -> HookRegistry {
        let mut hooks: AHashMap<Hook, Vec<Arc<dyn Plugin>>> = AHashMap::new();

        for plugin in &self.plugins {
            internal!(
                level = INFO,
                "Registering plugin {} for {:?}",
                plugin.name(),
                plugin.hooks()
            );
            for hook in plugin.hooks() {
                hooks.entry(*hook).or_default().push(Arc::clone(plugin));
            }
        }

        HookRegistry {
            hooks,
            plugins: self.plugins,
            timeouts: self.timeouts,
            default_timeout: self
                .default_timeout
                .unwrap_or_else(|| Duration::from_secs(default_timeout())),
        }
    }
}
