//! Configuration loading for the Kindle sender.
//!
//! All user-tunable settings are centralized here and loaded from
//! `conf/config.toml` if present. Any missing or invalid entries fall back to
//! sensible defaults so the pipeline can still run against a stock Calibre
//! installation on `PATH`.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File suffixes accepted for queueing, matched case-insensitively.
pub const INPUT_FORMATS: &[&str] = &[
    ".epub", ".mobi", ".azw", ".azw3", ".pdf", ".txt", ".html", ".docx", ".rtf", ".fb2",
];

/// Output container formats offered to the user.
pub const OUTPUT_FORMATS: &[&str] = &["azw3", "mobi", "epub", "pdf", "txt"];

/// The container format the device reads natively; "send" always targets it.
pub const KINDLE_NATIVE_FORMAT: &str = "azw3";

/// Fixed thumbnail envelope the device expects under `system/thumbnails`.
pub const THUMBNAIL_WIDTH: u32 = 330;
pub const THUMBNAIL_HEIGHT: u32 = 470;
pub const THUMBNAIL_JPEG_QUALITY: u8 = 90;

/// Chunk size for the device byte-copy.
pub const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// High-level app configuration; deserializable from TOML.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AppConfig {
    #[serde(default = "default_ebook_convert_bin")]
    pub ebook_convert_bin: String,
    #[serde(default = "default_ebook_meta_bin")]
    pub ebook_meta_bin: String,
    /// Working directory for conversion artifacts (output files and covers).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: f64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ebook_convert_bin: default_ebook_convert_bin(),
            ebook_meta_bin: default_ebook_meta_bin(),
            work_dir: default_work_dir(),
            output_format: default_output_format(),
            scan_interval_secs: default_scan_interval_secs(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Clamp a requested output format to the supported list.
    pub fn sanitized_output_format(&self) -> String {
        let normalized = self
            .output_format
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if OUTPUT_FORMATS.contains(&normalized.as_str()) {
            normalized
        } else {
            warn!(
                requested = %self.output_format,
                "Unsupported output format in config; using {KINDLE_NATIVE_FORMAT}"
            );
            default_output_format()
        }
    }
}

/// Whether a file's suffix is one we can queue for conversion.
pub fn is_supported_input(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
        return false;
    };
    let dotted = format!(".{}", ext.to_ascii_lowercase());
    INPUT_FORMATS.contains(&dotted.as_str())
}

pub fn load_config(path: &Path) -> AppConfig {
    let contents = match fs::read_to_string(path) {
        Ok(data) => {
            info!(path = %path.display(), "Loaded base config");
            data
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                "Falling back to default config: {err}"
            );
            return AppConfig::default();
        }
    };

    match toml::from_str::<AppConfig>(&contents) {
        Ok(cfg) => {
            debug!("Parsed configuration from disk");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid config TOML: {err}");
            AppConfig::default()
        }
    }
}

fn default_ebook_convert_bin() -> String {
    "ebook-convert".to_string()
}

fn default_ebook_meta_bin() -> String {
    "ebook-meta".to_string()
}

fn default_work_dir() -> PathBuf {
    dirs_home().join(".kindle-sender").join("temp")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn default_output_format() -> String {
    KINDLE_NATIVE_FORMAT.to_string()
}

fn default_scan_interval_secs() -> f64 {
    2.0
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_config_falls_back_to_defaults() {
        let cfg = load_config(Path::new("/definitely/not/here/config.toml"));
        assert_eq!(cfg.output_format, KINDLE_NATIVE_FORMAT);
        assert_eq!(cfg.ebook_convert_bin, "ebook-convert");
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let cfg: AppConfig = toml::from_str("output_format = \"epub\"").unwrap();
        assert_eq!(cfg.output_format, "epub");
        assert_eq!(cfg.ebook_meta_bin, "ebook-meta");
        assert_eq!(cfg.log_level, LogLevel::Info);
    }

    #[test]
    fn output_format_is_sanitized() {
        let cfg = AppConfig {
            output_format: ".EPUB ".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(cfg.sanitized_output_format(), "epub");

        let cfg = AppConfig {
            output_format: "cbz".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(cfg.sanitized_output_format(), KINDLE_NATIVE_FORMAT);
    }

    #[test]
    fn input_suffix_match_is_case_insensitive() {
        assert!(is_supported_input(Path::new("/tmp/Book.EPUB")));
        assert!(is_supported_input(Path::new("book.fb2")));
        assert!(!is_supported_input(Path::new("book.cbz")));
        assert!(!is_supported_input(Path::new("no_extension")));
    }
}
