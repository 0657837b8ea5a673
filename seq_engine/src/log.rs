//! Per-instance user log.
//!
//! Lines written by state programs through `StateSetContext::log` go to the
//! file named by the `logfile` launch macro, or to `tracing` (target
//! `seq::user`) when no file is configured.

use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

#[derive(Debug, Default)]
pub(crate) struct UserLog {
    file: Option<Mutex<File>>,
}

impl UserLog {
    /// Open `path` for writing. Falls back to `tracing` if that fails.
    pub(crate) fn open(path: Option<&str>) -> Self {
        let Some(path) = path.filter(|p| !p.is_empty()) else {
            return Self::default();
        };
        match File::create(Path::new(path)) {
            Ok(file) => Self {
                file: Some(Mutex::new(file)),
            },
            Err(e) => {
                error!(logfile = path, "cannot open log file: {e}");
                Self::default()
            }
        }
    }

    pub(crate) fn write(&self, thread_name: &str, message: &str) {
        let Some(file) = &self.file else {
            info!(target: "seq::user", thread = thread_name, "{message}");
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "{thread_name} {}.{:06}: {message}\n",
            now.as_secs(),
            now.subsec_micros()
        );
        let mut file = file.lock();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            error!("user log write failed: {e}");
        }
    }
}
