//! Persisted settings structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the scratch directory created under the platform temp location.
pub const CACHE_DIR_NAME: &str = "ez_ffmpeg";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the settings file
    Io(io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
    /// Threshold text is not a positive number
    InvalidThreshold(String),
    /// Target rate outside the supported slider range
    InvalidTargetRate(u32),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to access settings file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse settings: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize settings: {}", e),
            ConfigError::InvalidThreshold(raw) => write!(
                f,
                "Threshold must be a number greater than 0, got '{}'",
                raw
            ),
            ConfigError::InvalidTargetRate(rate) => write!(
                f,
                "Target rate must be between {} and {} MB/min, got {}",
                crate::processing::MIN_TARGET_RATE,
                crate::processing::MAX_TARGET_RATE,
                rate
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

fn default_true() -> bool {
    true
}

fn default_target_rate() -> u32 {
    12
}

fn default_threshold() -> String {
    "2".to_string()
}

/// Processing toggles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionsConfig {
    /// Apply dynamic loudness normalization to audio
    #[serde(default = "default_true")]
    pub normalize: bool,
    /// Downmix audio to two channels
    #[serde(default = "default_true")]
    pub stereo: bool,
    /// Replace the original file with an accepted encode
    #[serde(default = "default_true")]
    pub replace: bool,
    /// Re-encode video to the size budget
    #[serde(default = "default_true")]
    pub convert: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            stereo: true,
            replace: true,
            convert: true,
        }
    }
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_audio_codec() -> String {
    "libmp3lame".to_string()
}

/// External tool locations and codec choices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Encoder binary
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// Duration prober binary
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Video encoder passed to `-c:v`
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Audio encoder passed to `-c:a`
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
        }
    }
}

/// Scratch directory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Scratch directory (platform temp dir + `ez_ffmpeg` when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Encode from a working copy in the scratch directory instead of the source tree
    #[serde(default)]
    pub copy_source: bool,
}

impl CacheConfig {
    /// The scratch directory to use for this run.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(CACHE_DIR_NAME))
    }
}

/// Main settings structure, persisted between sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Folder selected in the previous session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_folder: Option<PathBuf>,
    /// Target size budget in MB per minute
    #[serde(default = "default_target_rate")]
    pub target_rate: u32,
    /// Tolerance above the target, kept as entered text
    #[serde(default = "default_threshold")]
    pub threshold: String,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_folder: None,
            target_rate: default_target_rate(),
            threshold: default_threshold(),
            options: OptionsConfig::default(),
            tools: ToolsConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Parse a boolean override, accepting true/1/yes and false/0/no
fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse settings from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Apply environment variable overrides to the settings
    ///
    /// Overrides the following values if environment variables are set:
    /// - EZ_FFMPEG_TARGET_RATE -> target_rate
    /// - EZ_FFMPEG_THRESHOLD -> threshold
    /// - EZ_FFMPEG_FFMPEG / EZ_FFMPEG_FFPROBE -> tools
    /// - EZ_FFMPEG_CACHE_DIR -> cache.dir
    /// - EZ_FFMPEG_NORMALIZE, EZ_FFMPEG_STEREO, EZ_FFMPEG_REPLACE, EZ_FFMPEG_CONVERT -> options
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("EZ_FFMPEG_TARGET_RATE") {
            if let Ok(rate) = val.trim().parse::<u32>() {
                self.target_rate = rate;
            }
        }

        // Kept verbatim; validated when the processing snapshot is taken
        if let Ok(val) = env::var("EZ_FFMPEG_THRESHOLD") {
            self.threshold = val;
        }

        if let Ok(val) = env::var("EZ_FFMPEG_FFMPEG") {
            self.tools.ffmpeg = PathBuf::from(val);
        }

        if let Ok(val) = env::var("EZ_FFMPEG_FFPROBE") {
            self.tools.ffprobe = PathBuf::from(val);
        }

        if let Ok(val) = env::var("EZ_FFMPEG_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(val));
        }

        let toggles: [(&str, &mut bool); 4] = [
            ("EZ_FFMPEG_NORMALIZE", &mut self.options.normalize),
            ("EZ_FFMPEG_STEREO", &mut self.options.stereo),
            ("EZ_FFMPEG_REPLACE", &mut self.options.replace),
            ("EZ_FFMPEG_CONVERT", &mut self.options.convert),
        ];
        for (key, slot) in toggles {
            if let Some(flag) = env::var(key).ok().as_deref().and_then(parse_bool) {
                *slot = flag;
            }
        }
    }

    /// Load settings from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut settings = Self::load_from_file(path)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load settings, falling back to defaults when the file is missing or malformed.
    ///
    /// A missing file is the normal first-run case and yields no error. A file
    /// that exists but cannot be read or parsed is returned alongside the
    /// defaults so the caller can report it.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<ConfigError>) {
        match Self::load(&path) {
            Ok(settings) => (settings, None),
            Err(e) => {
                let mut settings = Self::default();
                settings.apply_env_overrides();
                let missing = matches!(&e, ConfigError::Io(err) if err.kind() == io::ErrorKind::NotFound);
                (settings, if missing { None } else { Some(e) })
            }
        }
    }

    /// Write settings to a TOML file, creating parent directories as needed
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
