//! Ebook conversion via Calibre's `ebook-convert`.
//!
//! The converter is synchronous; the pipeline runs it on a background
//! worker thread. Progress is parsed out of the tool's streamed output and
//! mapped onto bands so the overall bar stays monotonic across sub-steps:
//! cover extraction below 10, the converter's own 0-100% inside [10, 80],
//! metadata read-back and cover verification above 80.

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)%").expect("valid regex"));
static ASIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)mobi-asin:([a-f0-9-]+)").expect("valid regex"));

const MAX_STEM_LEN: usize = 80;
const MAX_STAGE_LEN: usize = 50;
const MAX_DIAGNOSTIC_LEN: usize = 2000;

/// What a successful conversion hands back to the pipeline.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub output_path: PathBuf,
    /// Cover saved next to the output as `<stem>_cover.jpg`, if any source
    /// or output cover could be extracted.
    pub cover_path: Option<PathBuf>,
    /// Identifier the converter embedded into the output's metadata, used
    /// to correlate the device thumbnail.
    pub asin: Option<String>,
}

pub struct Converter {
    ebook_convert_bin: String,
    ebook_meta_bin: String,
    work_dir: PathBuf,
}

impl Converter {
    pub fn new(
        ebook_convert_bin: impl Into<String>,
        ebook_meta_bin: impl Into<String>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            ebook_convert_bin: ebook_convert_bin.into(),
            ebook_meta_bin: ebook_meta_bin.into(),
            work_dir,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Convert `input` to `output_format`, preserving the cover where
    /// possible. `progress` receives (percent, stage) pairs in [0, 100].
    pub fn convert(
        &self,
        input: &Path,
        output_format: &str,
        progress: &(dyn Fn(f32, &str) + Send + Sync),
    ) -> Result<ConversionOutcome> {
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("failed to create {}", self.work_dir.display()))?;

        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("book");
        let clean = clean_filename(stem);
        let output_path = self.work_dir.join(format!("{clean}.{output_format}"));
        let saved_cover = self.work_dir.join(format!("{clean}_cover.jpg"));

        if output_path.exists() {
            fs::remove_file(&output_path)
                .with_context(|| format!("failed to remove stale {}", output_path.display()))?;
        }

        let scratch = tempfile::tempdir().context("failed to create scratch directory")?;
        let scratch_cover = scratch.path().join("cover.jpg");

        progress(5.0, "Extracting cover");
        let mut cover_path = None;
        if self.extract_cover(input, &scratch_cover) {
            fs::copy(&scratch_cover, &saved_cover)
                .with_context(|| format!("failed to save cover to {}", saved_cover.display()))?;
            cover_path = Some(saved_cover.clone());
        } else {
            debug!(path = %input.display(), "No cover found in source file");
        }

        progress(10.0, "Converting");
        info!(
            input = %input.display(),
            output = %output_path.display(),
            format = output_format,
            "Starting conversion"
        );
        self.run_converter(input, &output_path, cover_path.as_deref(), progress)?;

        if !output_path.exists() {
            bail!("output file not found after conversion: {}", output_path.display());
        }

        progress(85.0, "Reading metadata");
        let asin = self.extract_asin(&output_path);
        match &asin {
            Some(asin) => info!(asin = %asin, "Converter assigned identifier"),
            None => warn!("No mobi-asin found in converted file; thumbnail will be skipped"),
        }

        if cover_path.is_none() {
            // Some formats only expose a cover after conversion.
            progress(90.0, "Verifying cover");
            let verify_cover = scratch.path().join("verify_cover.jpg");
            if self.extract_cover(&output_path, &verify_cover) {
                fs::copy(&verify_cover, &saved_cover).with_context(|| {
                    format!("failed to save cover to {}", saved_cover.display())
                })?;
                cover_path = Some(saved_cover);
                debug!("Recovered cover from converted output");
            }
        }

        progress(100.0, "Complete");
        Ok(ConversionOutcome {
            output_path,
            cover_path,
            asin,
        })
    }

    /// Run `ebook-convert`, streaming interleaved output for `NN%` progress
    /// lines; fails hard on a non-zero exit, carrying the diagnostic tail.
    fn run_converter(
        &self,
        input: &Path,
        output: &Path,
        cover: Option<&Path>,
        progress: &(dyn Fn(f32, &str) + Send + Sync),
    ) -> Result<()> {
        let mut cmd = Command::new(&self.ebook_convert_bin);
        cmd.arg(input).arg(output);
        if let Some(cover) = cover {
            cmd.arg("--cover").arg(cover);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", self.ebook_convert_bin))?;
        let stdout = child.stdout.take().context("converter stdout unavailable")?;
        let stderr = child.stderr.take().context("converter stderr unavailable")?;

        let mut captured_err = String::new();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    report_percent_line(&line, progress);
                    captured_err.push_str(&line);
                    captured_err.push('\n');
                }
            });

            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                report_percent_line(&line, progress);
            }
        });

        let status = child.wait().context("failed to wait for converter")?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            bail!(
                "conversion failed with code {code}: {}",
                truncate_chars(captured_err.trim(), MAX_DIAGNOSTIC_LEN)
            );
        }
        Ok(())
    }

    /// Extract a cover image into `dest`; true iff a non-empty file landed.
    fn extract_cover(&self, input: &Path, dest: &Path) -> bool {
        let result = Command::new(&self.ebook_meta_bin)
            .arg(input)
            .arg("--get-cover")
            .arg(dest)
            .output();
        match result {
            Ok(_) => fs::metadata(dest).map(|m| m.len() > 0).unwrap_or(false),
            Err(err) => {
                debug!(tool = %self.ebook_meta_bin, "Cover extraction failed: {err}");
                false
            }
        }
    }

    /// Read back the `mobi-asin` the converter embedded into the output.
    fn extract_asin(&self, book: &Path) -> Option<String> {
        let output = match Command::new(&self.ebook_meta_bin).arg(book).output() {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(
                    code = output.status.code().unwrap_or(-1),
                    "ebook-meta read-back returned non-zero"
                );
                return None;
            }
            Err(err) => {
                debug!(tool = %self.ebook_meta_bin, "Identifier read-back failed: {err}");
                return None;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        ASIN_RE
            .captures(&stdout)
            .map(|captures| captures[1].to_string())
    }
}

fn report_percent_line(line: &str, progress: &(dyn Fn(f32, &str) + Send + Sync)) {
    if let Some(captures) = PERCENT_RE.captures(line) {
        if let Ok(raw_pct) = captures[1].parse::<f32>() {
            // The tool's own 0-100% occupies the [10, 80] band.
            let mapped = (10.0 + raw_pct * 0.70).clamp(0.0, 100.0);
            progress(mapped, &truncate_chars(line.trim(), MAX_STAGE_LEN));
        }
    }
}

/// Strip characters illegal in file names, collapse whitespace and cap the
/// length; applied identically to output files and saved covers so the two
/// stay name-correlated.
pub fn clean_filename(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, MAX_STEM_LEN)
}

/// Char-boundary-safe truncation.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
