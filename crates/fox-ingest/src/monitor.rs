//! Polling watcher over the drop directory.
//!
//! Each poll looks for the three fixed report names. A found `.xls` is
//! converted (when a converter is configured), imported, and removed once the
//! import succeeds. A leftover `.xlsx` from an earlier failed attempt is
//! retried on the next poll.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{Converter, ImportReport, Importer, IngestConfig, IngestError, ReportKind};

#[derive(Debug, Clone)]
pub enum PollResult {
    Imported(ImportReport),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: ReportKind,
    pub path: PathBuf,
    pub result: PollResult,
}

pub struct FileMonitor {
    input_dir: PathBuf,
    poll_interval: Duration,
    import_timeout: Duration,
    converter: Converter,
    importer: Importer,
}

async fn remove(path: &Path) -> Result<(), IngestError> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl FileMonitor {
    pub fn new(config: &IngestConfig, importer: Importer) -> Self {
        Self {
            input_dir: config.input_dir.clone(),
            poll_interval: config.poll_interval,
            import_timeout: config.import_timeout,
            converter: config.converter(),
            importer,
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = converter;
        self
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    async fn import_with_timeout(&self, kind: ReportKind, path: &Path) -> Result<ImportReport, IngestError> {
        tokio::time::timeout(self.import_timeout, self.importer.import_file(kind, path))
            .await
            .map_err(|_| IngestError::Timeout {
                what: "import",
                after: self.import_timeout,
            })?
    }

    /// Imports `path` and removes it once the rows are committed.
    async fn import_and_remove(&self, kind: ReportKind, path: &Path) -> Result<ImportReport, IngestError> {
        let report = self.import_with_timeout(kind, path).await?;
        remove(path).await?;
        Ok(report)
    }

    async fn handle(&self, kind: ReportKind) -> Option<(PathBuf, Result<ImportReport, IngestError>)> {
        let legacy = self.input_dir.join(kind.file_name());
        let modern = legacy.with_extension("xlsx");

        if legacy.is_file() {
            if !self.converter.is_enabled() {
                let result = self.import_and_remove(kind, &legacy).await;
                return Some((legacy, result));
            }
            let result = match self.converter.convert(&legacy).await {
                Ok(converted) => match remove(&legacy).await {
                    Ok(()) => self.import_and_remove(kind, &converted).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            return Some((legacy, result));
        }

        if modern.is_file() {
            let result = self.import_and_remove(kind, &modern).await;
            return Some((modern, result));
        }
        None
    }

    /// One pass over the three report names. Failures are reported, never
    /// raised, and leave the offending file in place.
    pub async fn poll_once(&self) -> Vec<FileEvent> {
        let mut events = Vec::new();
        for kind in ReportKind::ALL {
            let Some((path, result)) = self.handle(kind).await else {
                continue;
            };
            let result = match result {
                Ok(report) => {
                    info!(kind = %kind, inserted = report.inserted, "picked up report");
                    PollResult::Imported(report)
                }
                Err(err) => {
                    error!(kind = %kind, file = %path.display(), error = %err, "report processing failed");
                    PollResult::Failed(err.to_string())
                }
            };
            events.push(FileEvent { kind, path, result });
        }
        events
    }

    /// Polls until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            dir = %self.input_dir.display(),
            interval_secs = self.poll_interval.as_secs(),
            converter = self.converter.is_enabled(),
            "watching for reports"
        );
        if !self.input_dir.is_dir() {
            warn!(dir = %self.input_dir.display(), "input directory does not exist yet");
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("file monitor stopped");
    }
}
