//! Entry point for the Kindle sender.
//!
//! Responsibilities here are intentionally minimal:
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml`.
//! - Queue the given books and drive the pipeline to completion,
//!   optionally transferring to a connected Kindle or saving locally.

mod config;
mod convert;
mod device;
mod metadata;
mod pipeline;
mod task;

use crate::config::load_config;
use crate::convert::Converter;
use crate::device::DeviceManager;
use crate::metadata::MetadataReader;
use crate::pipeline::Pipeline;
use crate::task::{TaskQueue, TaskStatus};
use anyhow::{Context, Result, anyhow, bail};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let args = parse_args()?;
    let config = load_config(&args.config);
    set_log_level(reload_handle, config.log_level.as_filter_str());

    let output_format = match &args.format {
        Some(format) => {
            let requested = config::AppConfig {
                output_format: format.clone(),
                ..config.clone()
            };
            requested.sanitized_output_format()
        }
        None => config.sanitized_output_format(),
    };
    info!(
        format = %output_format,
        work_dir = %config.work_dir.display(),
        "Starting Kindle sender"
    );

    let queue = Arc::new(TaskQueue::new());
    let converter = Arc::new(Converter::new(
        config.ebook_convert_bin.clone(),
        config.ebook_meta_bin.clone(),
        config.work_dir.clone(),
    ));
    let devices = Arc::new(DeviceManager::new());
    let metadata = MetadataReader::new(config.ebook_meta_bin.clone(), &config.work_dir);
    let mut pipeline = Pipeline::new(
        Arc::clone(&queue),
        converter,
        Arc::clone(&devices),
        metadata,
    );

    for file in &args.files {
        if let Err(err) = pipeline.add_book(file, &output_format) {
            warn!(path = %file.display(), "Skipping file: {err:#}");
        }
    }
    if queue.is_empty() {
        bail!("no usable input files");
    }

    if args.send {
        let interval = Duration::from_secs_f64(config.scan_interval_secs.max(0.5));
        devices.start_monitoring(interval);
        wait_for_device(&devices, interval)?;
        pipeline.send_all()?;
    } else if let Some(folder) = &args.save {
        pipeline.save_converted(folder)?;
    } else {
        pipeline.convert_all();
    }

    pipeline.run_until_idle();
    devices.stop_monitoring();

    let mut failed = 0usize;
    for task in queue.list_all() {
        if task.status == TaskStatus::Failed {
            failed += 1;
        }
        println!("{}", summary_line(&task));
    }
    if failed > 0 {
        bail!("{failed} task(s) failed");
    }
    Ok(())
}

/// Block until a Kindle shows up, or the user interrupts the wait.
fn wait_for_device(devices: &Arc<DeviceManager>, interval: Duration) -> Result<()> {
    if devices.is_connected() {
        return Ok(());
    }
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    info!("Waiting for a Kindle to connect (Ctrl-C to abort)");
    while !devices.is_connected() {
        if interrupted.load(Ordering::SeqCst) {
            bail!("interrupted while waiting for a device");
        }
        std::thread::sleep(interval.min(Duration::from_millis(500)));
    }
    let device = devices.device().ok_or_else(|| anyhow!("device vanished"))?;
    info!(
        name = %device.name,
        free = %device.free_space(),
        books = device.books().len(),
        "Kindle ready"
    );
    Ok(())
}

/// One end-of-run summary line per task; failed tasks carry their error.
fn summary_line(task: &crate::task::BookTask) -> String {
    match task.status {
        TaskStatus::Failed => format!(
            "{:<12} {}: {}",
            task.status,
            task.metadata.display_title(),
            task.error_message
        ),
        _ => format!("{:<12} {}", task.status, task.metadata.display_title()),
    }
}

struct CliArgs {
    files: Vec<PathBuf>,
    format: Option<String>,
    send: bool,
    save: Option<PathBuf>,
    config: PathBuf,
}

fn parse_args() -> Result<CliArgs> {
    let mut files = Vec::new();
    let mut format = None;
    let mut send = false;
    let mut save = None;
    let mut config = PathBuf::from("conf/config.toml");

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--format" => {
                format = Some(args.next().ok_or_else(|| anyhow!("--format needs a value"))?);
            }
            "--send" => send = true,
            "--save" => {
                save = Some(PathBuf::from(
                    args.next().ok_or_else(|| anyhow!("--save needs a value"))?,
                ));
            }
            "--config" => {
                config = PathBuf::from(
                    args.next().ok_or_else(|| anyhow!("--config needs a value"))?,
                );
            }
            "--help" | "-h" => {
                bail!(
                    "Usage: kindle-sender [--format FMT] [--send | --save DIR] \
                     [--config PATH] <books>..."
                );
            }
            other => {
                let path = PathBuf::from(other);
                if !path.exists() {
                    bail!("file not found: {}", path.display());
                }
                files.push(path);
            }
        }
    }

    if files.is_empty() {
        bail!(
            "Usage: kindle-sender [--format FMT] [--send | --save DIR] \
             [--config PATH] <books>..."
        );
    }
    if send && save.is_some() {
        bail!("--send and --save are mutually exclusive");
    }
    Ok(CliArgs {
        files,
        format,
        send,
        save,
        config,
    })
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
