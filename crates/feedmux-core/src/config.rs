use std::time::Duration;

/// Default time an engine waits for the peer's first announce before it
/// treats the peer as holding no feeds for the group.
pub const DEFAULT_ANNOUNCE_GRACE: Duration = Duration::from_secs(2);

/// Default cap on keys accepted in a single announce.
pub const DEFAULT_MAX_ANNOUNCE_KEYS: usize = 64 * 1024;

/// Muxer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Grace period before an engine without remote announces becomes steady
    pub announce_grace: Duration,
    /// Announces listing more keys than this are treated as malformed
    pub max_announce_keys: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            announce_grace: DEFAULT_ANNOUNCE_GRACE,
            max_announce_keys: DEFAULT_MAX_ANNOUNCE_KEYS,
        }
    }
}

impl MuxConfig {
    pub fn with_announce_grace(mut self, grace: Duration) -> Self {
        self.announce_grace = grace;
        self
    }

    pub fn with_max_announce_keys(mut self, max: usize) -> Self {
        self.max_announce_keys = max;
        self
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for unset ones.
    ///
    /// Recognized variables:
    /// - `FEEDMUX_ANNOUNCE_GRACE_MS`: grace period in milliseconds
    /// - `FEEDMUX_MAX_ANNOUNCE_KEYS`: key cap per announce (must be > 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("FEEDMUX_ANNOUNCE_GRACE_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "FEEDMUX_ANNOUNCE_GRACE_MS",
                value: raw.clone(),
            })?;
            config.announce_grace = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("FEEDMUX_MAX_ANNOUNCE_KEYS") {
            let max: usize = raw
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "FEEDMUX_MAX_ANNOUNCE_KEYS",
                    value: raw.clone(),
                })?;
            config.max_announce_keys = max;
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
