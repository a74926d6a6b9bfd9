use serde::Deserialize;

use crate::Error;

/// Environment variable that switches on long stack traces.
pub const DEBUG_ENV: &str = "DEFERRED_PROMISE_DEBUG";
/// Environment variable selecting the clock (`virtual` or `real`).
pub const CLOCK_ENV: &str = "DEFERRED_PROMISE_CLOCK";

/// How the default [`TurnQueue`](crate::TurnQueue) measures time for timers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Time only advances when the queue is idle and jumps straight to the next deadline.
    #[default]
    Virtual,
    /// Wall-clock time; an idle queue sleeps until the next deadline.
    Real,
}

/// Runtime settings.
///
/// # Examples
///
/// ```
/// use deferred_promise::{ClockMode, Config};
/// let config = Config::from_toml("long_stack_traces = true\nclock = \"real\"").unwrap();
/// assert!(config.long_stack_traces);
/// assert_eq!(config.clock, ClockMode::Real);
/// assert!(config.track_unhandled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clock: ClockMode,
    pub long_stack_traces: bool,
    pub track_unhandled: bool,
    pub catch_panics: bool,
    pub max_turns: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clock: ClockMode::Virtual,
            long_stack_traces: false,
            track_unhandled: true,
            catch_panics: true,
            max_turns: None,
        }
    }
}

impl Config {
    pub fn from_toml(source: &str) -> Result<Self, Error> {
        toml::from_str(source).map_err(|err| Error::Config(err.to_string()))
    }

    /// Defaults, overridden by [`DEBUG_ENV`] and [`CLOCK_ENV`] when set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Config::default();
        if let Some(debug) = lookup(DEBUG_ENV) {
            config.long_stack_traces = !matches!(debug.as_str(), "" | "0" | "false");
        }
        if let Some(clock) = lookup(CLOCK_ENV) {
            config.clock = match clock.to_ascii_lowercase().as_str() {
                "virtual" => ClockMode::Virtual,
                "real" => ClockMode::Real,
                other => return Err(Error::Config(format!("unknown clock `{other}`"))),
            };
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_toml_max_turns() {
        let config = Config::from_toml("max_turns = 10\ncatch_panics = false").unwrap();
        assert_eq!(config.max_turns, Some(10));
        assert!(!config.catch_panics);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(Config::from_toml("clock = \"sundial\""), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_lookup() {
        let config = Config::from_lookup(|key| match key {
            DEBUG_ENV => Some("1".into()),
            CLOCK_ENV => Some("Real".into()),
            _ => None,
        })
        .unwrap();
        assert!(config.long_stack_traces);
        assert_eq!(config.clock, ClockMode::Real);

        let config = Config::from_lookup(|key| (key == DEBUG_ENV).then(|| "0".into())).unwrap();
        assert!(!config.long_stack_traces);

        let err = Config::from_lookup(|key| (key == CLOCK_ENV).then(|| "lunar".into()));
        assert!(err.is_err());
    }
}
