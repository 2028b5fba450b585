use rollcall_core::{Settings, WorkflowTimings, EMBEDDING_DIM};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Nominal capture resolution requested from the camera.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    /// Descriptor length the embedding model produces.
    pub embedding_dim: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the TOML file holding school-day thresholds.
    pub settings_path: PathBuf,
    /// Maximum embedding distance for a positive identification.
    pub distance_threshold: f32,
    pub timings: WorkflowTimings,
    /// Entries kept in the recent-activity feed.
    pub feed_len: usize,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("rollcall");

        let defaults = WorkflowTimings::default();

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_parse("ROLLCALL_CAMERA_WIDTH", 640),
            camera_height: env_parse("ROLLCALL_CAMERA_HEIGHT", 480),
            model_dir,
            detector_model: std::env::var("ROLLCALL_DETECTOR_MODEL")
                .unwrap_or_else(|_| "det_10g.onnx".to_string()),
            embedder_model: std::env::var("ROLLCALL_EMBEDDER_MODEL")
                .unwrap_or_else(|_| "face_recognition.onnx".to_string()),
            embedding_dim: env_parse("ROLLCALL_EMBEDDING_DIM", EMBEDDING_DIM),
            db_path: std::env::var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("attendance.db")),
            settings_path: std::env::var("ROLLCALL_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| config_dir.join("settings.toml")),
            distance_threshold: env_parse("ROLLCALL_DISTANCE_THRESHOLD", 0.5),
            timings: WorkflowTimings {
                tick_interval: env_millis("ROLLCALL_TICK_MS", defaults.tick_interval),
                cooldown: env_millis("ROLLCALL_COOLDOWN_MS", defaults.cooldown),
                commit_delay: env_millis("ROLLCALL_COMMIT_DELAY_MS", defaults.commit_delay),
                settle_delay: env_millis("ROLLCALL_SETTLE_MS", defaults.settle_delay),
            },
            feed_len: env_parse("ROLLCALL_FEED_LEN", rollcall_core::recorder::DEFAULT_FEED_LEN),
            system_bus: std::env::var("ROLLCALL_BUS")
                .map(|v| v == "system")
                .unwrap_or(false),
        }
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedder_model)
            .to_string_lossy()
            .into_owned()
    }
}

/// Read school-day settings from a TOML file. A missing file yields the
/// defaults; a malformed one is an error.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_settings(&text)
            .map_err(|e| anyhow::anyhow!("invalid settings file {}: {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no settings file; using defaults");
            Ok(Settings::default())
        }
        Err(e) => Err(anyhow::anyhow!("reading {}: {e}", path.display())),
    }
}

fn parse_settings(text: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str(text)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings_full() {
        let s = parse_settings(
            r#"
            check_in_time = "07:45"
            late_time = "08:15"
            check_out_time = "15:30"
            "#,
        )
        .unwrap();
        assert_eq!(s.check_in_time.to_string(), "07:45");
        assert_eq!(s.late_time.to_string(), "08:15");
        assert_eq!(s.check_out_time.to_string(), "15:30");
    }

    #[test]
    fn test_parse_settings_partial_uses_defaults() {
        let s = parse_settings(r#"late_time = "09:00""#).unwrap();
        assert_eq!(s.late_time.to_string(), "09:00");
        assert_eq!(s.check_out_time, Settings::default().check_out_time);
    }

    #[test]
    fn test_parse_settings_rejects_bad_time() {
        assert!(parse_settings(r#"late_time = "9am""#).is_err());
    }

    #[test]
    fn test_missing_settings_file_is_default() {
        let s = load_settings(Path::new("/nonexistent/rollcall/settings.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_model_paths() {
        let mut config = Config::from_env();
        config.model_dir = PathBuf::from("/opt/models");
        config.detector_model = "det.onnx".into();
        assert_eq!(config.detector_model_path(), "/opt/models/det.onnx");
    }
}
