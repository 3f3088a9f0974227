//! Engine configuration.

use makeright_core::FiberError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::yield_interval`].
pub const YIELD_INTERVAL_ENV: &str = "MAKERIGHT_YIELD_INTERVAL";

/// Environment variable setting [`EngineConfig::default_step_timeout_ms`].
pub const STEP_TIMEOUT_ENV: &str = "MAKERIGHT_STEP_TIMEOUT_MS";

/// Tuning for an [`Engine`](crate::Engine).
///
/// Deserializes with defaults for missing fields, so a config section only
/// needs to name what it changes.
///
/// # Examples
///
/// ```
/// use makeright::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     yield_interval: 16,
///     default_step_timeout_ms: Some(30_000),
///     ..EngineConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.default_step_timeout(), Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name recorded in logs.
    pub name: String,
    /// Consecutive `Continue` steps a fiber runs before yielding its worker
    /// thread to other fibers. Must be at least 1.
    pub yield_interval: u32,
    /// Bound on each `apply` call for steps that declare no timeout of
    /// their own. `None` leaves them unbounded.
    pub default_step_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "makeright".to_string(),
            yield_interval: 64,
            default_step_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Default configuration overridden by `MAKERIGHT_*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`FiberError::Configuration`] when a variable does not parse
    /// or the result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, FiberError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FiberError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(YIELD_INTERVAL_ENV) {
            config.yield_interval = parse_var(YIELD_INTERVAL_ENV, &raw)?;
        }
        if let Some(raw) = lookup(STEP_TIMEOUT_ENV) {
            config.default_step_timeout_ms = Some(parse_var(STEP_TIMEOUT_ENV, &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), FiberError> {
        if self.yield_interval == 0 {
            return Err(FiberError::Configuration(
                "yield_interval must be greater than 0".to_string(),
            ));
        }
        if self.default_step_timeout_ms == Some(0) {
            return Err(FiberError::Configuration(
                "default_step_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// [`default_step_timeout_ms`](Self::default_step_timeout_ms) as a
    /// `Duration`.
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, FiberError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| FiberError::Configuration(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.yield_interval, 64);
        assert_eq!(config.default_step_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (YIELD_INTERVAL_ENV, "8"),
            (STEP_TIMEOUT_ENV, " 1500 "),
        ]))
        .unwrap();
        assert_eq!(config.yield_interval, 8);
        assert_eq!(
            config.default_step_timeout(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_env_rejects_garbage_and_zero() {
        let err = EngineConfig::from_lookup(lookup(&[(YIELD_INTERVAL_ENV, "lots")])).unwrap_err();
        assert!(matches!(err, FiberError::Configuration(msg) if msg.contains(YIELD_INTERVAL_ENV)));

        let err = EngineConfig::from_lookup(lookup(&[(YIELD_INTERVAL_ENV, "0")])).unwrap_err();
        assert!(matches!(err, FiberError::Configuration(_)));
    }
}
