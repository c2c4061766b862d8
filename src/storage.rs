//! Temporary upload storage and delayed cleanup.
//!
//! Every file a request writes is recorded in a [`TempFiles`] guard opened from the
//! [`Janitor`]. The guard hands its files to the janitor exactly once, when it is finished
//! or dropped, so a failed or abandoned request still gets cleaned up. The janitor removes
//! the files after a fixed delay on a detached task; failures are logged and go nowhere else.

use std::{
    mem,
    path::{Path, PathBuf},
    time::Duration,
};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::RelayError;

/// URL prefix under which the upload directory is served.
pub const UPLOADS_ROUTE: &str = "/uploads";

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<unix millis>-<random>` plus the original file's extension, if any.
    pub fn unique_name(original_name: Option<&str>) -> String {
        let ext = original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
        format!("{}-{}{}", millis, suffix, ext)
    }

    /// Writes an uploaded file under a fresh unique name.
    ///
    /// A partially written file is removed before the error is returned.
    pub async fn save(
        &self,
        original_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<PathBuf, RelayError> {
        let path = self.dir.join(Self::unique_name(original_name));
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            discard_partial(&path).await;
            return Err(e.into());
        }
        Ok(path)
    }

    /// Public URL of a file living in the upload directory.
    pub fn public_url(path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", UPLOADS_ROUTE, name)
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!("Removed partially written upload {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("Failed to remove partial upload {}: {}", path.display(), e),
    }
}

/// Distinct set of files written while serving one request, in creation order.
///
/// Opened with [`Janitor::session`]; scheduled for deletion by [`TempFiles::finish`] or,
/// failing that, on drop.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<PathBuf>,
    janitor: Option<Janitor>,
}

impl TempFiles {
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Hands the tracked files to the janitor. `None` for a detached set.
    pub fn finish(mut self) -> Option<JoinHandle<CleanupReport>> {
        self.hand_off()
    }

    fn hand_off(&mut self) -> Option<JoinHandle<CleanupReport>> {
        let janitor = self.janitor.take()?;
        Some(janitor.schedule(mem::take(&mut self.paths)))
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        if self.janitor.is_none() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            error!(
                "No runtime to schedule cleanup of {} temporary files",
                self.paths.len()
            );
            return;
        }
        self.hand_off();
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Deletes request files after a fixed delay.
#[derive(Debug, Clone)]
pub struct Janitor {
    delay: Duration,
}

impl Janitor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Opens a per-request file set bound to this janitor.
    pub fn session(&self) -> TempFiles {
        TempFiles {
            paths: Vec::new(),
            janitor: Some(self.clone()),
        }
    }

    /// Spawns the delayed delete. Callers normally drop the handle.
    pub fn schedule(&self, paths: Vec<PathBuf>) -> JoinHandle<CleanupReport> {
        let delay = self.delay;
        tokio::spawn(async move {
            let mut report = CleanupReport::default();
            if paths.is_empty() {
                return report;
            }

            tokio::time::sleep(delay).await;
            for path in paths {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        info!("Deleted temporary file: {}", path.display());
                        report.deleted.push(path);
                    }
                    Err(e) => {
                        error!("Failed to delete temporary file {}: {}", path.display(), e);
                        report.failed.push(path);
                    }
                }
            }
            report
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_keeps_extension() {
        let name = UploadStore::unique_name(Some("jersey photo.JPG"));
        assert!(name.ends_with(".JPG"));

        let (millis, rest) = name.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        let suffix = rest.trim_end_matches(".JPG");
        assert!(suffix.parse::<u32>().unwrap() < 1_000_000_000);
    }

    #[test]
    fn test_unique_name_without_extension() {
        let name = UploadStore::unique_name(None);
        assert!(!name.contains('.'));
        assert!(name.contains('-'));
    }

    #[test]
    fn test_public_url() {
        let url = UploadStore::public_url(Path::new("/srv/uploads/1700-42_polygon.png"));
        assert_eq!(url, "/uploads/1700-42_polygon.png");
    }

    #[test]
    fn test_temp_files_dedupe() {
        let mut files = TempFiles::default();
        files.track("/tmp/a.png");
        files.track("/tmp/a.png");
        files.track("/tmp/b.png");
        assert_eq!(
            files.paths(),
            &[PathBuf::from("/tmp/a.png"), PathBuf::from("/tmp/b.png")]
        );
    }

    #[tokio::test]
    async fn test_save_writes_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());

        let path = store.save(Some("shirt.png"), b"bytes").await.unwrap();

        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"bytes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_waits_then_deletes_once() {
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("upload.png");
        let crop = dir.path().join("upload_polygon.png");
        std::fs::write(&upload, b"a").unwrap();
        std::fs::write(&crop, b"b").unwrap();

        let mut files = Janitor::new(Duration::from_secs(30)).session();
        files.track(&upload);
        files.track(&crop);
        files.track(&upload);

        let handle = files.finish().unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(upload.exists(), "nothing deleted before the delay");

        let report = handle.await.unwrap();
        assert_eq!(report.deleted, vec![upload.clone(), crop.clone()]);
        assert!(report.failed.is_empty());
        assert!(!upload.exists());
        assert!(!crop.exists());
    }

    #[tokio::test]
    async fn test_janitor_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Janitor::new(Duration::ZERO).session();
        files.track(dir.path().join("gone.png"));

        let report = files.finish().unwrap().await.unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_still_schedules_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("abandoned.png");
        std::fs::write(&upload, b"a").unwrap();

        {
            let mut files = Janitor::new(Duration::ZERO).session();
            files.track(&upload);
        }

        for _ in 0..100 {
            if !upload.exists() {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!upload.exists());
    }

    #[tokio::test]
    async fn test_detached_set_has_nothing_to_schedule() {
        let mut files = TempFiles::default();
        files.track("/tmp/never-written.png");
        assert!(files.finish().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("missing-subdir"));

        let err = store.save(Some("shirt.png"), b"bytes").await.unwrap_err();

        assert!(matches!(err, RelayError::Storage(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
