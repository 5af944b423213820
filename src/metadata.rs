//! Best-effort metadata lookup for queued books.
//!
//! Shells out to Calibre's `ebook-meta` for title, author and cover. Every
//! failure degrades to filename-derived values; adding a book to the queue
//! never fails on metadata alone.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Title\s*:\s*(.+)$").expect("valid regex"));
static AUTHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Author\(s\)\s*:\s*(.+)$").expect("valid regex"));
static AUTHOR_SORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\[[^\]]+\]").expect("valid regex"));

pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// Immutable description of a source file, captured at queueing time.
#[derive(Debug, Clone)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    /// Extracted cover preview, if the tool produced one.
    pub cover_path: Option<PathBuf>,
    pub source_path: PathBuf,
    /// Human-readable source size, e.g. "1.4 MB".
    pub file_size: String,
    /// Upper-cased source suffix, e.g. "EPUB".
    pub format: String,
}

impl BookMetadata {
    /// Filename-derived metadata used when the lookup tool is unavailable.
    pub fn fallback(path: &Path) -> Self {
        Self {
            title: stem_title(path),
            author: UNKNOWN_AUTHOR.to_string(),
            cover_path: None,
            source_path: path.to_path_buf(),
            file_size: fs::metadata(path)
                .map(|m| human_size(m.len()))
                .unwrap_or_else(|_| "0.0 B".to_string()),
            format: format_tag(path),
        }
    }

    /// Title truncated for one-line display.
    pub fn display_title(&self) -> String {
        if self.title.chars().count() > 50 {
            let short: String = self.title.chars().take(50).collect();
            format!("{short}...")
        } else {
            self.title.clone()
        }
    }
}

/// Wrapper around the `ebook-meta` lookup tool.
pub struct MetadataReader {
    ebook_meta_bin: String,
    preview_dir: PathBuf,
}

impl MetadataReader {
    pub fn new(ebook_meta_bin: impl Into<String>, work_dir: &Path) -> Self {
        Self {
            ebook_meta_bin: ebook_meta_bin.into(),
            preview_dir: work_dir.join("previews"),
        }
    }

    /// Look up title/author/cover for `path`. Never fails; the worst case is
    /// filename-derived metadata with no cover.
    pub fn extract(&self, path: &Path) -> BookMetadata {
        let mut meta = BookMetadata::fallback(path);

        match Command::new(&self.ebook_meta_bin).arg(path).output() {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(title) = parse_title(&stdout) {
                    meta.title = title;
                }
                if let Some(author) = parse_author(&stdout) {
                    meta.author = author;
                }
            }
            Ok(output) => {
                debug!(
                    path = %path.display(),
                    code = output.status.code().unwrap_or(-1),
                    "ebook-meta lookup returned non-zero; using filename metadata"
                );
            }
            Err(err) => {
                warn!(
                    tool = %self.ebook_meta_bin,
                    "Metadata tool unavailable: {err}"
                );
                return meta;
            }
        }

        meta.cover_path = self.extract_cover(path);
        meta
    }

    fn extract_cover(&self, path: &Path) -> Option<PathBuf> {
        if let Err(err) = fs::create_dir_all(&self.preview_dir) {
            warn!(dir = %self.preview_dir.display(), "Cannot create preview dir: {err}");
            return None;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("cover");
        let dest = self
            .preview_dir
            .join(format!("{}.jpg", crate::convert::clean_filename(stem)));

        let status = Command::new(&self.ebook_meta_bin)
            .arg(path)
            .arg("--get-cover")
            .arg(&dest)
            .output();
        if let Err(err) = status {
            debug!(path = %path.display(), "Cover preview extraction failed: {err}");
            return None;
        }

        let non_empty = fs::metadata(&dest).map(|m| m.len() > 0).unwrap_or(false);
        non_empty.then_some(dest)
    }
}

pub fn parse_title(output: &str) -> Option<String> {
    TITLE_RE
        .captures(output)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_author(output: &str) -> Option<String> {
    let raw = AUTHOR_RE.captures(output).map(|c| c[1].trim().to_string())?;
    // ebook-meta appends the sort form in brackets: "Jane Doe [Doe, Jane]".
    let cleaned = AUTHOR_SORT_RE.replace_all(&raw, "").trim().to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Human-readable byte count, one decimal place.
pub fn human_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

fn stem_title(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .to_string()
}

fn format_tag(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(0), "0.0 B");
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn parses_ebook_meta_output() {
        let output = "Title               : The Fifth Season\n\
                      Author(s)           : N. K. Jemisin [Jemisin, N. K.]\n\
                      Languages           : eng\n";
        assert_eq!(parse_title(output).as_deref(), Some("The Fifth Season"));
        assert_eq!(parse_author(output).as_deref(), Some("N. K. Jemisin"));
    }

    #[test]
    fn missing_fields_parse_to_none() {
        let output = "Languages           : eng\n";
        assert!(parse_title(output).is_none());
        assert!(parse_author(output).is_none());
    }

    #[test]
    fn fallback_uses_filename() {
        let meta = BookMetadata::fallback(Path::new("/nowhere/Some Book.epub"));
        assert_eq!(meta.title, "Some Book");
        assert_eq!(meta.author, UNKNOWN_AUTHOR);
        assert_eq!(meta.format, "EPUB");
        assert!(meta.cover_path.is_none());
    }

    #[test]
    fn display_title_truncates_long_titles() {
        let mut meta = BookMetadata::fallback(Path::new("x.epub"));
        meta.title = "a".repeat(60);
        assert_eq!(meta.display_title().chars().count(), 53);
        meta.title = "short".to_string();
        assert_eq!(meta.display_title(), "short");
    }
}
