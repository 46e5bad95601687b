//! Durable target storage + retry utilities for slotwatch.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slotwatch_core::{GlobalStatus, RunConfig, Target};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "slotwatch-storage";

const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether waiting and trying again can help.
pub trait RetryClassify {
    fn disposition(&self) -> RetryDisposition;
}

/// Retry with exponential backoff. Only [`RetryDisposition::Retryable`] failures are retried;
/// anything else surfaces after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Wait before retrying after the failed attempt at `attempt_index` (0-based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify,
    {
        self.execute_with(op, |_, _| {}).await
    }

    /// Like [`RetryPolicy::execute`], calling `on_retry(error, retry_number)` after each
    /// backoff wait and before the next attempt.
    pub async fn execute_with<T, E, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify,
        R: FnMut(&E, usize),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.disposition() == RetryDisposition::NonRetryable || attempt + 1 >= attempts {
                return Err(err);
            }

            let delay = self.delay_for_attempt(attempt);
            debug!(attempt = attempt + 1, max_attempts = attempts, ?delay, "transient failure, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
            on_retry(&err, attempt);
        }
    }
}

/// Everything the agent needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    pub schema_version: u32,
    pub targets: Vec<Target>,
    pub run: RunConfig,
}

impl Default for StoredState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            targets: Vec::new(),
            run: RunConfig::default(),
        }
    }
}

/// JSON-file target store. Writes go through a temp file and an atomic rename so a
/// reader never observes a half-written list.
#[derive(Debug)]
pub struct TargetStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TargetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored state. A missing file is an empty store. Monitoring never resumes
    /// on its own: the global status comes back as stopped with no pending wake time.
    pub async fn load(&self) -> anyhow::Result<StoredState> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking store path {}", self.path.display()))?
        {
            return Ok(StoredState::default());
        }

        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut state: StoredState =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))?;

        state.run.global_status = GlobalStatus::Stopped;
        state.run.next_run_at = None;
        Ok(state)
    }

    pub async fn save(&self, state: &StoredState) -> anyhow::Result<()> {
        let span = info_span!("store_save", path = %self.path.display(), targets = state.targets.len());
        async {
            let _guard = self.write_lock.lock().await;
            let bytes = serde_json::to_vec_pretty(state).context("serializing target store")?;

            let parent = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("creating store directory {}", parent.display()))?;

            let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
            drop(file);

            if let Err(err) = fs::rename(&temp_path, &self.path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp store {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                });
            }
            debug!("target store saved");
            Ok::<(), anyhow::Error>(())
        }
        .instrument(span)
        .await
    }
}
