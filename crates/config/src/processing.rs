//! Validated processing snapshot and target presets

use crate::config::{ConfigError, Settings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest target rate the budget slider allows (MB/min)
pub const MIN_TARGET_RATE: u32 = 2;
/// Highest target rate the budget slider allows (MB/min)
pub const MAX_TARGET_RATE: u32 = 45;

/// Configuration snapshot read once at the start of a run.
///
/// Immutable for the whole run; the worker never re-reads settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSpec {
    /// Target size budget in MB per minute
    pub target_rate: u32,
    /// Tolerance added to the target before a file counts as over budget
    pub threshold: f64,
    /// Re-encode video to the budget
    pub convert: bool,
    /// Apply dynamic loudness normalization
    pub normalize: bool,
    /// Downmix audio to stereo
    pub stereo: bool,
    /// Replace originals with accepted encodes
    pub replace: bool,
}

impl ProcessingSpec {
    /// Take a validated snapshot of the current settings.
    ///
    /// Fails when the threshold text is not a positive number or the target
    /// rate falls outside the slider range.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let threshold = parse_threshold(&settings.threshold)?;
        if !(MIN_TARGET_RATE..=MAX_TARGET_RATE).contains(&settings.target_rate) {
            return Err(ConfigError::InvalidTargetRate(settings.target_rate));
        }

        Ok(Self {
            target_rate: settings.target_rate,
            threshold,
            convert: settings.options.convert,
            normalize: settings.options.normalize,
            stereo: settings.options.stereo,
            replace: settings.options.replace,
        })
    }

    /// Rate at or above which a file is considered over budget.
    pub fn rate_limit(&self) -> f64 {
        self.target_rate as f64 + self.threshold
    }

    /// Whether any audio filter is enabled.
    pub fn has_audio_filters(&self) -> bool {
        self.normalize || self.stereo
    }
}

/// Parse threshold text, requiring a finite number greater than zero.
pub fn parse_threshold(raw: &str) -> Result<f64, ConfigError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(ConfigError::InvalidThreshold(raw.to_string())),
    }
}

/// Quick target settings for common library types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Movies,
    Television,
    Animation,
}

impl Preset {
    /// Target rate in MB/min
    pub fn target_rate(&self) -> u32 {
        match self {
            Preset::Movies => 10,
            Preset::Television => 12,
            Preset::Animation => 8,
        }
    }

    /// Threshold text
    pub fn threshold(&self) -> &'static str {
        match self {
            Preset::Movies | Preset::Television => "2",
            Preset::Animation => "1",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Preset::Movies => write!(f, "movies"),
            Preset::Television => write!(f, "television"),
            Preset::Animation => write!(f, "animation"),
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "movies" | "movie" => Ok(Preset::Movies),
            "television" | "tv" => Ok(Preset::Television),
            "animation" | "anime" => Ok(Preset::Animation),
            other => Err(format!(
                "unknown preset '{}', expected movies, television or animation",
                other
            )),
        }
    }
}

impl Settings {
    /// Overwrite target rate and threshold with a preset's values
    pub fn apply_preset(&mut self, preset: Preset) {
        self.target_rate = preset.target_rate();
        self.threshold = preset.threshold().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_positive_thresholds_accepted(value in 0.001f64..1000.0) {
            let parsed = parse_threshold(&value.to_string()).expect("positive threshold");
            prop_assert!((parsed - value).abs() < 1e-9);
        }

        #[test]
        fn prop_non_positive_thresholds_rejected(value in -1000.0f64..=0.0) {
            let result = parse_threshold(&value.to_string());
            prop_assert!(matches!(result, Err(ConfigError::InvalidThreshold(_))));
        }

        #[test]
        fn prop_target_rate_range(rate in 0u32..100) {
            let settings = Settings { target_rate: rate, ..Settings::default() };
            let result = ProcessingSpec::from_settings(&settings);

            if (MIN_TARGET_RATE..=MAX_TARGET_RATE).contains(&rate) {
                prop_assert_eq!(result.expect("in range").target_rate, rate);
            } else {
                prop_assert!(matches!(result, Err(ConfigError::InvalidTargetRate(r)) if r == rate));
            }
        }
    }

    #[test]
    fn test_threshold_text_rejected() {
        for raw in ["", "abc", "two", "NaN", "inf", "1,5"] {
            assert!(
                matches!(parse_threshold(raw), Err(ConfigError::InvalidThreshold(_))),
                "'{}' should be rejected",
                raw
            );
        }
        assert_eq!(parse_threshold(" 2 ").unwrap(), 2.0);
    }

    #[test]
    fn test_snapshot_copies_toggles() {
        let mut settings = Settings::default();
        settings.options.normalize = false;
        settings.options.replace = false;
        settings.threshold = "1.5".to_string();

        let spec = ProcessingSpec::from_settings(&settings).unwrap();

        assert_eq!(spec.target_rate, 12);
        assert_eq!(spec.threshold, 1.5);
        assert!(spec.convert);
        assert!(!spec.normalize);
        assert!(spec.stereo);
        assert!(!spec.replace);
        assert_eq!(spec.rate_limit(), 13.5);
        assert!(spec.has_audio_filters());
    }

    #[test]
    fn test_presets() {
        let mut settings = Settings::default();

        settings.apply_preset(Preset::Movies);
        assert_eq!((settings.target_rate, settings.threshold.as_str()), (10, "2"));

        settings.apply_preset(Preset::Television);
        assert_eq!((settings.target_rate, settings.threshold.as_str()), (12, "2"));

        settings.apply_preset(Preset::Animation);
        assert_eq!((settings.target_rate, settings.threshold.as_str()), (8, "1"));
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("Movies".parse::<Preset>(), Ok(Preset::Movies));
        assert_eq!("tv".parse::<Preset>(), Ok(Preset::Television));
        assert_eq!("animation".parse::<Preset>(), Ok(Preset::Animation));
        assert!("documentary".parse::<Preset>().is_err());
        assert_eq!(Preset::Television.to_string(), "television");
    }
}
