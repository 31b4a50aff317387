//! # listener
//!
//! Shared lifecycle for every sensor/protocol source (J1939, UDS, OBD2,
//! GNSS, IMU): `setup` → repeated `tick` → `close`. A listener that fails
//! `setup()` is left disabled rather than crashing the process: log the
//! error, leave `enable` false.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::GatewayError;

/// Implemented by every concrete source. `setup` does whatever I/O is needed
/// to start receiving (opening a CAN socket, a serial port, binding rfcomm)
/// and returns an error instead of panicking when the hardware isn't there.
/// `tick` runs one iteration of the source's receive/publish loop; the
/// driving task calls it in a loop until the handle is disabled.
#[async_trait]
pub trait Listener: Send {
    fn name(&self) -> &str;

    async fn setup(&mut self) -> Result<(), GatewayError>;

    async fn tick(&mut self) -> Result<(), GatewayError>;

    /// Release any held resources. Default no-op; override for listeners
    /// that hold a socket or file handle needing an explicit shutdown.
    async fn close(&mut self) {}
}

/// Runs a [`Listener`]'s lifecycle as a background task and exposes an
/// `enabled` flag the fusion controller or `main` can poll or flip.
pub struct ListenerHandle {
    name: String,
    enabled: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Spawn `listener`: call `setup()`; if it fails, log and leave the
    /// handle disabled with no background task running. If it succeeds,
    /// drive `tick()` in a loop on a background task until `disable()` is
    /// called or the process exits.
    pub async fn spawn(mut listener: Box<dyn Listener>) -> Self {
        let name = listener.name().to_string();
        let enabled = Arc::new(AtomicBool::new(false));

        match listener.setup().await {
            Ok(()) => {
                enabled.store(true, Ordering::SeqCst);
                info!(listener = %name, "setup complete");
            }
            Err(e) => {
                error!(listener = %name, error = %e, "setup failed, listener disabled");
                return Self {
                    name,
                    enabled,
                    task: None,
                };
            }
        }

        let task_enabled = enabled.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            info!(listener = %task_name, "background loop started");
            while task_enabled.load(Ordering::SeqCst) {
                if let Err(e) = listener.tick().await {
                    error!(listener = %task_name, error = %e, "tick error, continuing");
                }
            }
            listener.close().await;
            info!(listener = %task_name, "background loop stopped");
        });

        Self {
            name,
            enabled,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Idempotent: closing an already-disabled handle is a no-op, matching
    /// the source's guarded `if not self.enable: return`.
    pub async fn close(&mut self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(listener = %self.name, "closing listener");
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Appends raw source data (one line per record) under
/// `<data_dir>/<listener-name>/`, rotating to a new file every hour so a
/// long-running gateway doesn't grow one unbounded file.
pub struct RawDataLogger {
    dir: PathBuf,
    name: String,
    current: Mutex<Option<(DateTime<Utc>, tokio::fs::File)>>,
}

impl RawDataLogger {
    pub fn new(data_dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            dir: data_dir.as_ref().join(name.to_lowercase()),
            name,
            current: Mutex::new(None),
        }
    }

    fn file_stamp(now: DateTime<Utc>) -> String {
        now.format("%Y%m%d_%H").to_string()
    }

    async fn file_for(&self, now: DateTime<Utc>) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(&self.dir).await?;
        Ok(self
            .dir
            .join(format!("{}_raw_{}.txt", self.name.to_lowercase(), Self::file_stamp(now))))
    }

    /// Append one line of raw data, opening (or rotating to) the current
    /// hour's file as needed.
    pub async fn append(&self, line: &str) {
        if let Err(e) = self.try_append(line).await {
            error!(listener = %self.name, error = %e, "error saving raw data");
        }
    }

    async fn try_append(&self, line: &str) -> Result<(), std::io::Error> {
        let now = Utc::now();
        let mut current = self.current.lock().await;

        let needs_new_file = match current.as_ref() {
            Some((opened_hour, _)) => opened_hour.format("%Y%m%d_%H").to_string() != Self::file_stamp(now),
            None => true,
        };

        if needs_new_file {
            let path = self.file_for(now).await?;
            let file = OpenOptions::new().create(true).append(true).open(path).await?;
            *current = Some((now, file));
        }

        if let Some((_, file)) = current.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingListener {
        ticks: Arc<AtomicU32>,
        fail_setup: bool,
    }

    #[async_trait]
    impl Listener for CountingListener {
        fn name(&self) -> &str {
            "counting"
        }

        async fn setup(&mut self) -> Result<(), GatewayError> {
            if self.fail_setup {
                return Err(GatewayError::CanUnavailable("can0".into(), "no such device".into()));
            }
            Ok(())
        }

        async fn tick(&mut self) -> Result<(), GatewayError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.ticks.load(Ordering::SeqCst) >= 3 {
                tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_setup_leaves_handle_disabled() {
        let listener = CountingListener {
            ticks: Arc::new(AtomicU32::new(0)),
            fail_setup: true,
        };
        let handle = ListenerHandle::spawn(Box::new(listener)).await;
        assert!(!handle.is_enabled());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = CountingListener {
            ticks: Arc::new(AtomicU32::new(0)),
            fail_setup: false,
        };
        let mut handle = ListenerHandle::spawn(Box::new(listener)).await;
        assert!(handle.is_enabled());
        handle.close().await;
        assert!(!handle.is_enabled());
        handle.close().await;
        assert!(!handle.is_enabled());
    }

    #[tokio::test]
    async fn raw_data_logger_appends_lines() {
        let dir = std::env::temp_dir().join(format!("telemetry-gateway-test-{:?}", std::thread::current().id()));
        let logger = RawDataLogger::new(&dir, "Test");
        logger.append("line one").await;
        logger.append("line two").await;

        let files: Vec<_> = std::fs::read_dir(dir.join("test")).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content, "line one\nline two\n");
    }
}
