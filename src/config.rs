//! Player configuration.

use crate::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs shared by players and the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Width of one preload block.
    pub block_duration: Duration,

    /// Memory ceiling for preloaded blocks, in bytes.
    /// Default: 512MB
    pub cache_ceiling_bytes: usize,

    /// Window after the current time whose blocks are never evicted.
    pub read_ahead: Duration,

    /// Wall-clock interval between playback batches.
    pub target_tick_interval: Duration,

    /// Upper bound on log time covered by one batch at speed 1.
    /// Keeps batches bounded after a stall (e.g. a held pause frame).
    pub max_tick_span: Duration,

    /// Minimum interval between state-only emissions while not playing.
    pub state_emit_interval: Duration,

    /// Playback speed on start.
    pub default_speed: f64,

    /// Stay idle after initialization instead of starting playback.
    pub start_paused: bool,

    /// Give up waiting on held pause frames after this long (None = wait forever).
    pub pause_frame_timeout: Option<Duration>,

    /// How often a waiting player re-checks its command queue.
    pub gate_poll_interval: Duration,

    /// Delay between live reconnect attempts.
    pub reconnect_interval: Duration,

    /// Maximum live messages carried by one emission; older ones are dropped.
    pub live_buffer_limit: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            block_duration: Duration::from_secs(1),
            cache_ceiling_bytes: 512 * 1024 * 1024,
            read_ahead: Duration::from_secs(5),
            target_tick_interval: Duration::from_millis(16),
            max_tick_span: Duration::from_millis(300),
            state_emit_interval: Duration::from_millis(100),
            default_speed: 1.0,
            start_paused: true,
            pause_frame_timeout: None,
            gate_poll_interval: Duration::from_millis(5),
            reconnect_interval: Duration::from_secs(1),
            live_buffer_limit: 10_000,
        }
    }
}

impl PlayerConfig {
    /// Parse a (possibly partial) JSON configuration; missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)
            .map_err(|e| PlayerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that every field is usable.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("block_duration", self.block_duration),
            ("target_tick_interval", self.target_tick_interval),
            ("max_tick_span", self.max_tick_span),
            ("gate_poll_interval", self.gate_poll_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(PlayerError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.cache_ceiling_bytes == 0 {
            return Err(PlayerError::InvalidConfig(
                "cache_ceiling_bytes must be non-zero".into(),
            ));
        }
        validate_speed(self.default_speed)?;
        if self.live_buffer_limit == 0 {
            return Err(PlayerError::InvalidConfig(
                "live_buffer_limit must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Playback speeds must be finite and positive.
pub(crate) fn validate_speed(speed: f64) -> Result<()> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(PlayerError::InvalidArgument(format!(
            "playback speed must be finite and positive, got {speed}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PlayerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PlayerConfig::from_json_str(
            r#"{"cache_ceiling_bytes": 1024, "block_duration": {"secs": 2, "nanos": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.cache_ceiling_bytes, 1024);
        assert_eq!(config.block_duration, Duration::from_secs(2));
        assert_eq!(config.read_ahead, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_zero_block_duration() {
        let config = PlayerConfig {
            block_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PlayerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_speed() {
        let config = PlayerConfig {
            default_speed: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(validate_speed(-1.0).is_err());
        assert!(validate_speed(0.5).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let result = PlayerConfig::from_json_str("{not json");
        assert!(matches!(result, Err(PlayerError::InvalidConfig(_))));
    }
}
