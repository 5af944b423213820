//! Orchestration of the convert/transfer pipeline.
//!
//! The pipeline owns the task queue and is driven from a single
//! coordinating thread. Each conversion or transfer runs on its own
//! short-lived worker thread; workers never touch the queue directly but
//! report back through an mpsc channel, exactly one completion event per
//! started operation. Removing a task while its operation is in flight is
//! fine: the eventual completion event finds no task and is dropped.

use crate::config::{KINDLE_NATIVE_FORMAT, is_supported_input};
use crate::convert::{ConversionOutcome, Converter, truncate_chars};
use crate::device::{DeviceManager, TransferSource};
use crate::metadata::MetadataReader;
use crate::task::{BookTask, TaskQueue, TaskStatus, TaskUpdate};
use anyhow::{Result, bail};
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const MAX_ERROR_LEN: usize = 300;

/// What to do with a task once its conversion succeeds.
#[derive(Debug, Clone)]
pub enum FollowUp {
    None,
    /// Chain into a device transfer, provided the device is still
    /// connected at completion time.
    SendToDevice,
    /// Copy the artifact into a local folder and mark the task done.
    SaveTo(PathBuf),
}

/// Completion and progress signals crossing back from worker threads.
#[derive(Debug)]
pub enum PipelineEvent {
    Progress {
        id: String,
        pct: f32,
    },
    ConversionDone {
        id: String,
        outcome: Result<ConversionOutcome, String>,
        follow_up: FollowUp,
    },
    TransferDone {
        id: String,
        result: Result<(), String>,
    },
}

pub struct Pipeline {
    queue: Arc<TaskQueue>,
    converter: Arc<Converter>,
    devices: Arc<DeviceManager>,
    metadata: MetadataReader,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    in_flight: usize,
}

impl Pipeline {
    pub fn new(
        queue: Arc<TaskQueue>,
        converter: Arc<Converter>,
        devices: Arc<DeviceManager>,
        metadata: MetadataReader,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        Self {
            queue,
            converter,
            devices,
            metadata,
            events_tx,
            events_rx,
            in_flight: 0,
        }
    }

    /// Look up metadata and enqueue a new task; rejects unsupported
    /// suffixes. Returns the new task's id.
    pub fn add_book(&self, path: &Path, output_format: &str) -> Result<String> {
        if !is_supported_input(path) {
            bail!("unsupported file type: {}", path.display());
        }
        let metadata = self.metadata.extract(path);
        let task = BookTask::new(metadata, output_format);
        let id = task.id.clone();
        info!(id = %id, path = %path.display(), "Book added to queue");
        self.queue.add(task);
        Ok(id)
    }

    /// Start a background conversion for a queued task.
    pub fn convert_task(&mut self, id: &str, follow_up: FollowUp) -> Result<()> {
        let Some(task) = self.queue.get(id) else {
            bail!("no such task: {id}");
        };
        if task.status != TaskStatus::Queued {
            bail!("task {id} is {} and cannot be converted", task.status);
        }

        // "Send" always targets the device-native container format,
        // whatever display format the user picked.
        let format = if matches!(follow_up, FollowUp::SendToDevice) {
            KINDLE_NATIVE_FORMAT.to_string()
        } else {
            task.output_format.clone()
        };

        self.queue.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Converting),
                progress: Some(0.0),
                output_format: Some(format.clone()),
                ..TaskUpdate::default()
            },
        );

        let converter = Arc::clone(&self.converter);
        let input = task.metadata.source_path.clone();
        let id = id.to_string();
        let tx = self.events_tx.clone();
        std::thread::spawn(move || {
            let progress_tx = Mutex::new(tx.clone());
            let progress_id = id.clone();
            let report = move |pct: f32, stage: &str| {
                debug!(id = %progress_id, pct, stage, "Conversion progress");
                if let Ok(tx) = progress_tx.lock() {
                    let _ = tx.send(PipelineEvent::Progress {
                        id: progress_id.clone(),
                        pct,
                    });
                }
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                converter.convert(&input, &format, &report)
            }));
            let outcome = match outcome {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(payload) => Err(panic_message(payload)),
            };
            let _ = tx.send(PipelineEvent::ConversionDone {
                id,
                outcome,
                follow_up,
            });
        });
        self.in_flight += 1;
        Ok(())
    }

    /// Fan out conversions over every queued task. Completion order across
    /// tasks is undefined.
    pub fn convert_all(&mut self) {
        for task in self.queue.list_queued() {
            if let Err(err) = self.convert_task(&task.id, FollowUp::None) {
                warn!(id = %task.id, "Skipping conversion: {err:#}");
            }
        }
    }

    /// "Send to device" for one task, converting first when needed.
    pub fn send_task(&mut self, id: &str) -> Result<()> {
        let Some(task) = self.queue.get(id) else {
            bail!("no such task: {id}");
        };
        match task.status {
            TaskStatus::Completed => Ok(()),
            TaskStatus::Converting | TaskStatus::Transferring => {
                debug!(id, "Operation already in flight; send ignored");
                Ok(())
            }
            TaskStatus::Failed => {
                debug!(id, "Task failed; requeue explicitly before sending");
                Ok(())
            }
            TaskStatus::Converted => {
                if artifact_is_native(&task) {
                    self.start_transfer(id)
                } else {
                    // Wrong container format cached: demote and reconvert to
                    // the native format, discarding the stale artifact.
                    info!(id, "Cached artifact is not device-native; reconverting");
                    if let Some(stale) = &task.converted_path {
                        if let Err(err) = fs::remove_file(stale) {
                            debug!(path = %stale.display(), "Stale artifact not removed: {err}");
                        }
                    }
                    self.queue.update(id, TaskUpdate::status(TaskStatus::Queued));
                    self.convert_task(id, FollowUp::SendToDevice)
                }
            }
            TaskStatus::Queued => self.convert_task(id, FollowUp::SendToDevice),
        }
    }

    /// Send every eligible task to the device.
    pub fn send_all(&mut self) -> Result<()> {
        if !self.devices.is_connected() {
            bail!("no Kindle device connected");
        }
        for task in self.queue.list_all() {
            if let Err(err) = self.send_task(&task.id) {
                warn!(id = %task.id, "Skipping send: {err:#}");
            }
        }
        Ok(())
    }

    /// Copy converted artifacts into `folder`; queued tasks are converted
    /// first and then copied.
    pub fn save_converted(&mut self, folder: &Path) -> Result<()> {
        fs::create_dir_all(folder)?;
        for task in self.queue.list_all() {
            match task.status {
                TaskStatus::Converted => {
                    if let Err(err) = self.finish_save(&task.id, folder) {
                        self.fail_task(&task.id, &format!("{err:#}"));
                    }
                }
                TaskStatus::Queued => {
                    if let Err(err) =
                        self.convert_task(&task.id, FollowUp::SaveTo(folder.to_path_buf()))
                    {
                        warn!(id = %task.id, "Skipping conversion: {err:#}");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Explicit user retry: return a failed task to the queue.
    pub fn retry_task(&self, id: &str) -> Result<()> {
        let Some(task) = self.queue.get(id) else {
            bail!("no such task: {id}");
        };
        if task.status != TaskStatus::Failed {
            bail!("task {id} is {}, not failed", task.status);
        }
        self.queue.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Queued),
                progress: Some(0.0),
                ..TaskUpdate::default()
            },
        );
        Ok(())
    }

    fn start_transfer(&mut self, id: &str) -> Result<()> {
        let Some(task) = self.queue.get(id) else {
            bail!("no such task: {id}");
        };
        let Some(converted_path) = task.converted_path.clone() else {
            bail!("task {id} has no converted artifact");
        };
        if !task.status.can_transition(TaskStatus::Transferring) {
            bail!("task {id} is {} and cannot be transferred", task.status);
        }

        self.queue.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Transferring),
                progress: Some(0.0),
                ..TaskUpdate::default()
            },
        );

        let devices = Arc::clone(&self.devices);
        let source = TransferSource::Artifact {
            path: converted_path,
            cover: task.cover_path.clone(),
            asin: task.device_asin.clone(),
        };
        let id = id.to_string();
        let tx = self.events_tx.clone();
        std::thread::spawn(move || {
            let progress_tx = Mutex::new(tx.clone());
            let progress_id = id.clone();
            let report = move |pct: f32| {
                if let Ok(tx) = progress_tx.lock() {
                    let _ = tx.send(PipelineEvent::Progress {
                        id: progress_id.clone(),
                        pct,
                    });
                }
            };

            let result = catch_unwind(AssertUnwindSafe(|| devices.transfer(&source, &report)));
            let result = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(payload) => Err(panic_message(payload)),
            };
            let _ = tx.send(PipelineEvent::TransferDone { id, result });
        });
        self.in_flight += 1;
        Ok(())
    }

    /// Drain completion events until no operation is in flight. The CLI
    /// driver blocks here; a GUI would pump the same receiver from its
    /// event loop.
    pub fn run_until_idle(&mut self) {
        while self.in_flight > 0 {
            match self.events_rx.recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
        }
    }

    /// Apply one worker event on the coordinating thread. Never panics on
    /// a background-reported error.
    pub fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Progress { id, pct } => {
                let Some(task) = self.queue.get(&id) else {
                    return;
                };
                if !matches!(
                    task.status,
                    TaskStatus::Converting | TaskStatus::Transferring
                ) {
                    return;
                }
                // Monotonic within an episode; late or reordered reports
                // never move the bar backwards.
                self.queue
                    .update(&id, TaskUpdate::progress(pct.max(task.progress)));
            }
            PipelineEvent::ConversionDone {
                id,
                outcome,
                follow_up,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.queue.get(&id).is_none() {
                    debug!(id, "Conversion finished for removed task; dropping");
                    return;
                }
                match outcome {
                    Ok(outcome) => self.on_converted(&id, outcome, follow_up),
                    Err(message) => self.fail_task(&id, &message),
                }
            }
            PipelineEvent::TransferDone { id, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.queue.get(&id).is_none() {
                    debug!(id, "Transfer finished for removed task; dropping");
                    return;
                }
                match result {
                    Ok(()) => {
                        info!(id, "Transfer completed");
                        self.queue.update(
                            &id,
                            TaskUpdate {
                                status: Some(TaskStatus::Completed),
                                progress: Some(100.0),
                                ..TaskUpdate::default()
                            },
                        );
                    }
                    Err(message) => self.fail_task(&id, &message),
                }
            }
        }
    }

    fn on_converted(&mut self, id: &str, outcome: ConversionOutcome, follow_up: FollowUp) {
        info!(id, output = %outcome.output_path.display(), "Conversion completed");
        self.queue.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Converted),
                progress: Some(100.0),
                converted_path: Some(outcome.output_path.clone()),
                cover_path: outcome.cover_path.clone(),
                device_asin: outcome.asin.clone(),
                ..TaskUpdate::default()
            },
        );

        match follow_up {
            FollowUp::None => {}
            FollowUp::SendToDevice => {
                // The device may have disconnected mid-conversion; check
                // again rather than trusting the state at request time.
                if self.devices.is_connected() {
                    if let Err(err) = self.start_transfer(id) {
                        self.fail_task(id, &format!("{err:#}"));
                    }
                } else {
                    warn!(id, "Device disconnected during conversion; leaving task converted");
                }
            }
            FollowUp::SaveTo(folder) => {
                if let Err(err) = self.finish_save(id, &folder) {
                    self.fail_task(id, &format!("{err:#}"));
                }
            }
        }
    }

    fn finish_save(&self, id: &str, folder: &Path) -> Result<()> {
        let Some(task) = self.queue.get(id) else {
            bail!("no such task: {id}");
        };
        let Some(artifact) = task.converted_path.clone() else {
            bail!("task {id} has no converted artifact");
        };
        let Some(name) = artifact.file_name() else {
            bail!("artifact has no file name: {}", artifact.display());
        };
        let dest = folder.join(name);
        fs::copy(&artifact, &dest)?;
        info!(id, dest = %dest.display(), "Saved converted book");
        self.queue.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                progress: Some(100.0),
                ..TaskUpdate::default()
            },
        );
        Ok(())
    }

    fn fail_task(&self, id: &str, message: &str) {
        warn!(id, "Task failed: {message}");
        self.queue.update(
            id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error_message: Some(truncate_chars(message, MAX_ERROR_LEN)),
                ..TaskUpdate::default()
            },
        );
    }
}

fn artifact_is_native(task: &BookTask) -> bool {
    task.converted_path
        .as_deref()
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(KINDLE_NATIVE_FORMAT))
        .unwrap_or(false)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("background worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("background worker panicked: {message}")
    } else {
        "background worker panicked".to_string()
    }
}

#[cfg(unix)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KindleDevice;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        queue: Arc<TaskQueue>,
        devices: Arc<DeviceManager>,
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const META_WITH_ASIN: &str = "if [ \"$2\" = \"--get-cover\" ]; then\n\
         cp \"$(dirname \"$0\")/cover_src.jpg\" \"$3\"\n\
         else\n\
         echo 'Title               : Test Book'\n\
         echo 'Author(s)           : Jane Doe [Doe, Jane]'\n\
         echo 'Identifiers         : mobi-asin:feed-f00d-42'\n\
         fi\n";

    const CONVERT_OK: &str = "echo '25% working'\necho '75% working'\ncp \"$1\" \"$2\"\n";

    fn fixture(convert_body: &str, meta_body: &str) -> (Fixture, Pipeline) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let convert_bin = write_script(&root, "ebook-convert", convert_body);
        let meta_bin = write_script(&root, "ebook-meta", meta_body);
        // Real JPEG bytes for the fake --get-cover to serve.
        image::RgbImage::from_pixel(120, 180, image::Rgb([10, 60, 120]))
            .save(root.join("cover_src.jpg"))
            .unwrap();

        let work = root.join("work");
        let queue = Arc::new(TaskQueue::new());
        let converter = Arc::new(Converter::new(
            convert_bin.to_str().unwrap(),
            meta_bin.to_str().unwrap(),
            work,
        ));
        let devices = Arc::new(DeviceManager::new());
        let metadata = MetadataReader::new(meta_bin.to_str().unwrap(), &root.join("work"));

        let pipeline = Pipeline::new(
            Arc::clone(&queue),
            converter,
            Arc::clone(&devices),
            metadata,
        );
        let fixture = Fixture {
            _dir: dir,
            root,
            queue,
            devices,
        };
        (fixture, pipeline)
    }

    fn connect_device(fx: &Fixture) -> KindleDevice {
        let root = fx.root.join("kindle");
        fs::create_dir_all(root.join("documents")).unwrap();
        fs::create_dir_all(root.join("system")).unwrap();
        let device = KindleDevice::new(root, "Kindle");
        fx.devices.adopt(Some(device.clone()));
        device
    }

    fn add_source(fx: &Fixture, pipeline: &Pipeline, name: &str, format: &str) -> String {
        let source = fx.root.join(name);
        fs::write(&source, b"epub bytes").unwrap();
        pipeline.add_book(&source, format).unwrap()
    }

    #[test]
    fn unsupported_suffix_is_rejected() {
        let (fx, pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let bad = fx.root.join("image.cbz");
        fs::write(&bad, b"zip").unwrap();
        assert!(pipeline.add_book(&bad, "azw3").is_err());
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn add_book_captures_metadata() {
        let (fx, pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");
        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.metadata.title, "Test Book");
        assert_eq!(task.metadata.author, "Jane Doe");
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn happy_path_convert_then_send() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let device = connect_device(&fx);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");

        pipeline.convert_task(&id, FollowUp::None).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Converted);
        let converted = task.converted_path.clone().unwrap();
        assert_eq!(converted.extension().unwrap(), "azw3");
        assert!(converted.exists());
        assert_eq!(task.device_asin.as_deref(), Some("feed-f00d-42"));

        pipeline.send_task(&id).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(device.documents_dir().join("book.azw3").exists());
        // Cover and asin were both present, so the thumbnail landed too.
        assert!(
            device
                .thumbnails_dir()
                .join("thumbnail_feed-f00d-42_EBOK_portrait.jpg")
                .exists()
        );
    }

    #[test]
    fn send_on_queued_task_converts_to_native_format_first() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let device = connect_device(&fx);
        // User picked epub for display, but "send" must force azw3.
        let id = add_source(&fx, &pipeline, "book.epub", "epub");

        pipeline.send_task(&id).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.converted_path.as_ref().unwrap().extension().unwrap(),
            "azw3"
        );
        assert!(device.documents_dir().join("book.azw3").exists());
    }

    #[test]
    fn wrong_cached_format_is_demoted_and_reconverted() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let device = connect_device(&fx);
        let id = add_source(&fx, &pipeline, "book.epub", "epub");

        pipeline.convert_task(&id, FollowUp::None).unwrap();
        pipeline.run_until_idle();
        let stale = fx.queue.get(&id).unwrap().converted_path.clone().unwrap();
        assert_eq!(stale.extension().unwrap(), "epub");

        pipeline.send_task(&id).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.converted_path.as_ref().unwrap().extension().unwrap(),
            "azw3"
        );
        assert!(!stale.exists(), "stale artifact should be discarded");
        assert!(device.documents_dir().join("book.azw3").exists());
    }

    #[test]
    fn converter_failure_marks_task_failed() {
        let (fx, mut pipeline) = fixture("echo 'broken input' >&2\nexit 2\n", META_WITH_ASIN);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");

        pipeline.convert_task(&id, FollowUp::None).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.error_message.is_empty());
        assert!(task.converted_path.is_none());

        // Explicit retry is the only path back to the queue.
        pipeline.retry_task(&id).unwrap();
        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.error_message.is_empty());
    }

    #[test]
    fn missing_asin_still_transfers_without_thumbnail() {
        let meta_no_asin = "if [ \"$2\" = \"--get-cover\" ]; then\n\
             cp \"$(dirname \"$0\")/cover_src.jpg\" \"$3\"\n\
             else\n\
             echo 'Title               : Test Book'\n\
             fi\n";
        let (fx, mut pipeline) = fixture(CONVERT_OK, meta_no_asin);
        let device = connect_device(&fx);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");

        pipeline.send_task(&id).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.device_asin.is_none());
        assert!(device.documents_dir().join("book.azw3").exists());
        assert!(!device.thumbnails_dir().exists());
    }

    #[test]
    fn removal_mid_flight_drops_completion_silently() {
        let slow_convert = "sleep 1\ncp \"$1\" \"$2\"\necho '100%'\n";
        let (fx, mut pipeline) = fixture(slow_convert, META_WITH_ASIN);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");

        pipeline.convert_task(&id, FollowUp::None).unwrap();
        fx.queue.remove(&id);

        pipeline.run_until_idle();
        assert!(fx.queue.is_empty());
        assert!(fx.queue.get(&id).is_none());
    }

    #[test]
    fn device_disconnect_during_conversion_leaves_task_converted() {
        let slow_convert = "sleep 1\ncp \"$1\" \"$2\"\n";
        let (fx, mut pipeline) = fixture(slow_convert, META_WITH_ASIN);
        connect_device(&fx);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");

        pipeline.send_task(&id).unwrap();
        fx.devices.adopt(None);
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Converted);
    }

    #[test]
    fn save_converted_copies_artifacts_and_completes() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");
        let out = fx.root.join("saved");

        pipeline.save_converted(&out).unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(out.join("book.azw3").exists());
    }

    #[test]
    fn failing_save_follow_up_marks_task_failed() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");
        let out = fx.root.join("saved");

        pipeline.save_converted(&out).unwrap();
        // Sabotage the destination while the conversion is in flight; the
        // completion-time copy must turn the error into a Failed task.
        fs::remove_dir_all(&out).unwrap();
        fs::write(&out, b"in the way").unwrap();
        pipeline.run_until_idle();

        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.error_message.is_empty());
    }

    #[test]
    fn failing_save_of_converted_task_marks_task_failed() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let id = add_source(&fx, &pipeline, "book.epub", "azw3");

        pipeline.convert_task(&id, FollowUp::None).unwrap();
        pipeline.run_until_idle();
        let artifact = fx.queue.get(&id).unwrap().converted_path.clone().unwrap();
        fs::remove_file(&artifact).unwrap();

        pipeline.save_converted(&fx.root.join("saved")).unwrap();
        let task = fx.queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.error_message.is_empty());
    }

    #[test]
    fn convert_all_fans_out_over_queued_tasks() {
        let (fx, mut pipeline) = fixture(CONVERT_OK, META_WITH_ASIN);
        let a = add_source(&fx, &pipeline, "one.epub", "azw3");
        let b = add_source(&fx, &pipeline, "two.epub", "mobi");

        pipeline.convert_all();
        pipeline.run_until_idle();

        for (id, ext) in [(a, "azw3"), (b, "mobi")] {
            let task = fx.queue.get(&id).unwrap();
            assert_eq!(task.status, TaskStatus::Converted);
            assert_eq!(
                task.converted_path.as_ref().unwrap().extension().unwrap(),
                ext
            );
        }
    }
}
