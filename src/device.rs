//! Kindle device detection and file transfer.
//!
//! Discovery is a filesystem probe for a mounted volume carrying the
//! Kindle marker directories. The manager polls on a background thread and
//! notifies subscribers only when the connection state actually changes.

use crate::config::{
    THUMBNAIL_HEIGHT, THUMBNAIL_JPEG_QUALITY, THUMBNAIL_WIDTH, TRANSFER_CHUNK_SIZE,
};
use crate::metadata::human_size;
use anyhow::{Context, Result, bail};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, RgbImage};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const BOOK_EXTENSIONS: &[&str] = &["azw3", "mobi", "azw", "pdf", "txt", "epub"];

/// A mounted reader device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindleDevice {
    pub root: PathBuf,
    pub name: String,
}

impl KindleDevice {
    pub fn new(root: PathBuf, name: impl Into<String>) -> Self {
        Self {
            root,
            name: name.into(),
        }
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join("system").join("thumbnails")
    }

    /// Best-effort free space on the device's volume.
    pub fn free_space(&self) -> String {
        use sysinfo::Disks;

        let disks = Disks::new_with_refreshed_list();
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let root_str = root.to_string_lossy();

        // Longest matching mount point is the most specific volume.
        let mut available: Option<u64> = None;
        let mut longest_match = 0;
        for disk in disks.list() {
            let mount = disk.mount_point().to_string_lossy();
            if root_str.starts_with(mount.as_ref()) && mount.len() > longest_match {
                available = Some(disk.available_space());
                longest_match = mount.len();
            }
        }

        match available {
            Some(bytes) => human_size(bytes),
            None => "Unknown".to_string(),
        }
    }

    /// Books already present in the device's documents directory.
    pub fn books(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.documents_dir()) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .map(|ext| BOOK_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// What gets copied to the device: either a bare file or a conversion
/// artifact carrying the cover and identifier needed for the thumbnail.
#[derive(Debug, Clone)]
pub enum TransferSource {
    RawPath(PathBuf),
    Artifact {
        path: PathBuf,
        cover: Option<PathBuf>,
        asin: Option<String>,
    },
}

impl TransferSource {
    fn resolve(&self) -> (&Path, Option<&Path>, Option<&str>) {
        match self {
            TransferSource::RawPath(path) => (path, None, None),
            TransferSource::Artifact { path, cover, asin } => {
                (path, cover.as_deref(), asin.as_deref())
            }
        }
    }
}

type ConnectionSubscriber = Arc<dyn Fn(Option<KindleDevice>) + Send + Sync>;

/// Tracks the connected device and performs transfers onto it.
#[derive(Default)]
pub struct DeviceManager {
    current: Mutex<Option<KindleDevice>>,
    subscribers: Mutex<Vec<ConnectionSubscriber>>,
    monitoring: AtomicBool,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self) -> Option<KindleDevice> {
        self.current.lock().expect("device lock poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.device().is_some()
    }

    /// Register a connection-state callback; invoked only on change
    /// (connect, disconnect, or device identity change), never per poll.
    pub fn subscribe(&self, subscriber: impl Fn(Option<KindleDevice>) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Arc::new(subscriber));
    }

    /// Probe for a device and adopt the result.
    pub fn scan(&self) -> Option<KindleDevice> {
        self.adopt(probe_platform())
    }

    /// Adopt a probe result, notifying subscribers on change. Split from
    /// [`DeviceManager::scan`] so connection handling can be exercised
    /// without a mounted volume.
    pub(crate) fn adopt(&self, probe: Option<KindleDevice>) -> Option<KindleDevice> {
        let changed = {
            let mut current = self.current.lock().expect("device lock poisoned");
            if *current == probe {
                false
            } else {
                match &probe {
                    Some(device) => info!(
                        root = %device.root.display(),
                        name = %device.name,
                        "Kindle connected"
                    ),
                    None => info!("Kindle disconnected"),
                }
                *current = probe.clone();
                true
            }
        };
        if changed {
            let snapshot: Vec<ConnectionSubscriber> = self
                .subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .clone();
            for subscriber in snapshot {
                subscriber(probe.clone());
            }
        }
        probe
    }

    /// Poll for connection changes on a background thread.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            debug!(interval_ms = interval.as_millis(), "Device monitor started");
            while manager.monitoring.load(Ordering::SeqCst) {
                manager.scan();
                std::thread::sleep(interval);
            }
            debug!("Device monitor stopped");
        });
    }

    pub fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }

    /// Copy a book onto the connected device, placing a matching thumbnail
    /// when both a cover and an identifier are available. Fails fast if no
    /// device is connected.
    pub fn transfer(
        &self,
        source: &TransferSource,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<()> {
        let Some(device) = self.device() else {
            bail!("no Kindle device connected");
        };
        transfer_to(&device, source, progress)
    }
}

/// The transfer protocol itself, against an explicit device.
pub fn transfer_to(
    device: &KindleDevice,
    source: &TransferSource,
    progress: &(dyn Fn(f32) + Send + Sync),
) -> Result<()> {
    let (book, cover, asin) = source.resolve();
    if !book.exists() {
        bail!("source file not found: {}", book.display());
    }

    let file_name = book
        .file_name()
        .with_context(|| format!("source has no file name: {}", book.display()))?;
    let dest = device.documents_dir().join(file_name);

    info!(
        book = %book.display(),
        dest = %dest.display(),
        "Transferring book to device"
    );
    copy_chunked(book, &dest, progress)?;

    // Both pieces are required to name the thumbnail; missing either is a
    // degraded but successful transfer.
    match (cover.filter(|c| c.exists()), asin) {
        (Some(cover), Some(asin)) => {
            progress(85.0);
            let thumbnails = device.thumbnails_dir();
            fs::create_dir_all(&thumbnails)
                .with_context(|| format!("failed to create {}", thumbnails.display()))?;
            let thumb_path = thumbnails.join(format!("thumbnail_{asin}_EBOK_portrait.jpg"));
            progress(90.0);
            match create_thumbnail(cover, &thumb_path) {
                Ok(()) => info!(path = %thumb_path.display(), "Thumbnail created"),
                Err(err) => warn!("Failed to create thumbnail: {err:#}"),
            }
        }
        (cover, asin) => {
            if asin.is_none() {
                debug!("No identifier available; skipping thumbnail");
            }
            if cover.is_none() {
                debug!("No cover available; skipping thumbnail");
            }
        }
    }

    progress(100.0);
    Ok(())
}

/// 1 MiB chunked copy reporting cumulative bytes as [0, 80] progress.
fn copy_chunked(src: &Path, dest: &Path, progress: &(dyn Fn(f32) + Send + Sync)) -> Result<()> {
    let total = fs::metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?
        .len();
    let mut reader =
        File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
    let mut writer =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut copied: u64 = 0;
    loop {
        let read = reader
            .read(&mut buf)
            .with_context(|| format!("read error on {}", src.display()))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buf[..read])
            .with_context(|| format!("write error on {}", dest.display()))?;
        copied += read as u64;
        if total > 0 {
            progress((copied as f32 / total as f32) * 80.0);
        }
    }
    writer
        .flush()
        .with_context(|| format!("flush error on {}", dest.display()))?;
    Ok(())
}

/// Decode a cover, flatten transparency onto white, fit it inside the
/// device thumbnail envelope and re-encode as baseline JPEG.
fn create_thumbnail(cover: &Path, dest: &Path) -> Result<()> {
    let decoded = image::open(cover)
        .with_context(|| format!("failed to decode cover {}", cover.display()))?;
    let flattened = flatten_on_white(&decoded);
    let resized = DynamicImage::ImageRgb8(flattened).resize(
        THUMBNAIL_WIDTH,
        THUMBNAIL_HEIGHT,
        FilterType::Lanczos3,
    );

    let rgb = resized.to_rgb8();
    let mut out =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    JpegEncoder::new_with_quality(&mut out, THUMBNAIL_JPEG_QUALITY)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .with_context(|| format!("failed to encode {}", dest.display()))?;
    Ok(())
}

fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f32 / 255.0;
        let blend = |channel: u8| -> u8 {
            (channel as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8
        };
        rgb.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    rgb
}

/// Platform probe for a mounted Kindle volume.
#[cfg(target_os = "windows")]
fn probe_platform() -> Option<KindleDevice> {
    probe_windows()
}

#[cfg(target_os = "macos")]
fn probe_platform() -> Option<KindleDevice> {
    probe_macos()
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn probe_platform() -> Option<KindleDevice> {
    probe_mount_roots(&linux_mount_roots())
}

#[cfg(target_os = "windows")]
fn probe_windows() -> Option<KindleDevice> {
    for letter in 'A'..='Z' {
        let drive = PathBuf::from(format!("{letter}:\\"));
        if !drive.exists() {
            continue;
        }
        if is_kindle_root(&drive) {
            let name = device_name(&drive);
            return Some(KindleDevice::new(drive, name));
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn probe_macos() -> Option<KindleDevice> {
    let volumes = Path::new("/Volumes");
    let entries = fs::read_dir(volumes).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_kindle_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase().contains("kindle"))
            .unwrap_or(false);
        if is_kindle_name && path.join("documents").exists() {
            let name = device_name(&path);
            return Some(KindleDevice::new(path, name));
        }
    }
    None
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn linux_mount_roots() -> Vec<PathBuf> {
    let user = std::env::var("USER").unwrap_or_default();
    vec![
        PathBuf::from("/media").join(&user),
        PathBuf::from("/mnt"),
        PathBuf::from("/run/media").join(&user),
    ]
}

/// Probe a set of mount roots for a volume with Kindle markers. Kept
/// root-list-driven so the detection logic is testable off-device.
fn probe_mount_roots(roots: &[PathBuf]) -> Option<KindleDevice> {
    for root in roots {
        let Ok(entries) = fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && is_kindle_root(&path) {
                let name = device_name(&path);
                return Some(KindleDevice::new(path, name));
            }
        }
    }
    None
}

fn is_kindle_root(path: &Path) -> bool {
    path.join("documents").exists()
        && (path.join("system").exists() || path.join("amazon-cover-bug").exists())
}

fn device_name(root: &Path) -> String {
    let version = root.join("system").join("version.txt");
    if let Ok(contents) = fs::read_to_string(version) {
        if contents.contains("Kindle") {
            return "Kindle".to_string();
        }
    }
    root.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .unwrap_or_else(|| "Kindle".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::sync::atomic::AtomicUsize;

    fn fake_device(dir: &Path) -> KindleDevice {
        let root = dir.join("kindle");
        fs::create_dir_all(root.join("documents")).unwrap();
        fs::create_dir_all(root.join("system")).unwrap();
        KindleDevice::new(root, "Kindle")
    }

    fn write_cover(path: &Path, width: u32, height: u32) {
        let img = RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 255]));
        img.save(path).unwrap();
    }

    #[test]
    fn mount_probe_finds_marked_volume() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");

        fs::create_dir_all(media.join("usbstick").join("documents")).unwrap();
        assert!(probe_mount_roots(&[media.clone()]).is_none());

        let kindle_root = media.join("kindle-volume");
        fs::create_dir_all(kindle_root.join("documents")).unwrap();
        fs::create_dir_all(kindle_root.join("amazon-cover-bug")).unwrap();
        let found = probe_mount_roots(&[media]).unwrap();
        assert_eq!(found.root, kindle_root);
        assert_eq!(found.name, "kindle-volume");
    }

    #[test]
    fn device_name_prefers_version_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vol");
        fs::create_dir_all(root.join("system")).unwrap();
        fs::write(root.join("system").join("version.txt"), "Kindle 5.16.2").unwrap();
        assert_eq!(device_name(&root), "Kindle");
    }

    #[test]
    fn subscribers_fire_only_on_connection_change() {
        let manager = DeviceManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        manager.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let device = KindleDevice::new(PathBuf::from("/tmp/kindle"), "Kindle");
        manager.adopt(Some(device.clone()));
        manager.adopt(Some(device.clone()));
        manager.adopt(Some(device.clone()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        manager.adopt(None);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        manager.adopt(None);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let other = KindleDevice::new(PathBuf::from("/tmp/other"), "Kindle");
        manager.adopt(Some(device));
        manager.adopt(Some(other));
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn transfer_copies_book_and_places_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let device = fake_device(dir.path());

        let book = dir.path().join("book.azw3");
        fs::write(&book, vec![7u8; 300_000]).unwrap();
        let cover = dir.path().join("cover.png");
        write_cover(&cover, 660, 940);

        let source = TransferSource::Artifact {
            path: book,
            cover: Some(cover),
            asin: Some("abcd-1234".to_string()),
        };
        let reported = Mutex::new(Vec::new());
        transfer_to(&device, &source, &|pct| {
            reported.lock().unwrap().push(pct);
        })
        .unwrap();

        assert!(device.documents_dir().join("book.azw3").exists());
        let thumb = device
            .thumbnails_dir()
            .join("thumbnail_abcd-1234_EBOK_portrait.jpg");
        assert!(thumb.exists());

        let thumb_img = image::open(&thumb).unwrap();
        assert!(thumb_img.width() <= THUMBNAIL_WIDTH);
        assert!(thumb_img.height() <= THUMBNAIL_HEIGHT);

        let reported = reported.into_inner().unwrap();
        assert!(reported.windows(2).all(|w| w[0] <= w[1]), "{reported:?}");
        assert_eq!(*reported.last().unwrap(), 100.0);
    }

    #[test]
    fn transfer_without_asin_skips_thumbnail_but_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let device = fake_device(dir.path());

        let book = dir.path().join("book.azw3");
        fs::write(&book, b"book bytes").unwrap();
        let cover = dir.path().join("cover.png");
        write_cover(&cover, 100, 150);

        let source = TransferSource::Artifact {
            path: book,
            cover: Some(cover),
            asin: None,
        };
        transfer_to(&device, &source, &|_| {}).unwrap();

        assert!(device.documents_dir().join("book.azw3").exists());
        // Thumbnail directory was never needed.
        assert!(!device.thumbnails_dir().exists());
    }

    #[test]
    fn transfer_fails_fast_on_missing_source_or_device() {
        let dir = tempfile::tempdir().unwrap();
        let device = fake_device(dir.path());

        let missing = TransferSource::RawPath(dir.path().join("gone.azw3"));
        assert!(transfer_to(&device, &missing, &|_| {}).is_err());

        let manager = DeviceManager::new();
        let book = dir.path().join("book.azw3");
        fs::write(&book, b"bytes").unwrap();
        let err = manager
            .transfer(&TransferSource::RawPath(book), &|_| {})
            .unwrap_err();
        assert!(err.to_string().contains("no Kindle device connected"));
    }

    #[test]
    fn thumbnail_flattens_transparency_onto_white() {
        let dir = tempfile::tempdir().unwrap();
        let cover = dir.path().join("cover.png");
        // Fully transparent image; every output pixel should be near-white.
        let img = RgbaImage::from_pixel(64, 64, image::Rgba([255, 0, 0, 0]));
        img.save(&cover).unwrap();

        let dest = dir.path().join("thumb.jpg");
        create_thumbnail(&cover, &dest).unwrap();

        let out = image::open(&dest).unwrap().to_rgb8();
        let pixel = out.get_pixel(32, 32).0;
        assert!(pixel.iter().all(|&c| c > 240), "{pixel:?}");
    }

    #[test]
    fn books_lists_only_ebook_files() {
        let dir = tempfile::tempdir().unwrap();
        let device = fake_device(dir.path());
        fs::write(device.documents_dir().join("a.azw3"), b"x").unwrap();
        fs::write(device.documents_dir().join("b.MOBI"), b"x").unwrap();
        fs::write(device.documents_dir().join("notes.json"), b"x").unwrap();

        let mut books: Vec<String> = device
            .books()
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        books.sort();
        assert_eq!(books, vec!["a.azw3", "b.MOBI"]);
    }
}
