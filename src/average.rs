use crate::prelude::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const STORE_VERSION: u32 = 1;

// AverageState {{{
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageState {
    pub total: f64,
    pub count: u64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl AverageState {
    pub fn add(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
        self.min_value = Some(self.min_value.map_or(value, |m| m.min(value)));
        self.max_value = Some(self.max_value.map_or(value, |m| m.max(value)));
    }

    /// `None` until the first sample is accepted.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count as f64)
        }
    }
} // }}}

// AverageStore {{{
#[derive(Serialize, Deserialize)]
struct StoredAverage {
    version: u32,
    key: String,
    data: AverageState,
}

/// One JSON file per average under the storage directory.
pub struct AverageStore {
    key: String,
    path: PathBuf,
    // serialises writers; the state to write is read while holding it
    lock: tokio::sync::Mutex<()>,
}

impl AverageStore {
    pub fn new(dir: &Path, key: &str) -> Self {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        Self {
            key: key.to_string(),
            path: dir.join(format!("{}.json", file)),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored state. A missing, unreadable or foreign file gives a
    /// fresh zero state.
    pub async fn load(&self) -> AverageState {
        let content = match tokio::fs::read(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no stored state for average {}, starting from zero", self.key);
                return AverageState::default();
            }
            Err(e) => {
                warn!("cannot read {}: {}, starting from zero", self.path.display(), e);
                return AverageState::default();
            }
        };

        match serde_json::from_slice::<StoredAverage>(&content) {
            Ok(stored) if stored.version == STORE_VERSION && stored.key == self.key => {
                debug!("loaded average {}: {:?}", self.key, stored.data);
                stored.data
            }
            Ok(stored) => {
                warn!(
                    "ignoring {}: version {} key {} does not match",
                    self.path.display(),
                    stored.version,
                    stored.key
                );
                AverageState::default()
            }
            Err(e) => {
                warn!("corrupt state in {}: {}, starting from zero", self.path.display(), e);
                AverageState::default()
            }
        }
    }

    /// Writes the state returned by `current` once the store is free, via a
    /// temporary file and a rename.
    pub async fn save_with<F>(&self, current: F) -> Result<()>
    where
        F: FnOnce() -> AverageState,
    {
        let _guard = self.lock.lock().await;
        let data = current();

        let stored = StoredAverage {
            version: STORE_VERSION,
            key: self.key.clone(),
            data,
        };
        let json = serde_json::to_vec_pretty(&stored)?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("saved average {} to {}", self.key, self.path.display());
        Ok(())
    }
} // }}}

// RunningAverage {{{
#[derive(Default)]
struct PendingSave {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: config::Average,
    store: AverageStore,
    state: Mutex<AverageState>,
    pending_save: Mutex<PendingSave>,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, AverageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_save(&self) -> std::sync::MutexGuard<'_, PendingSave> {
        self.pending_save.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self) -> Result<()> {
        self.store.save_with(|| self.state().clone()).await
    }

    // only a save that is still waiting out its delay can be cancelled; one
    // that has started writing has already detached itself
    fn cancel_pending_save(&self) {
        if let Some(handle) = self.pending_save().handle.take() {
            handle.abort();
        }
    }

    // true if `generation` is still the latest scheduled save
    fn claim_pending_save(&self, generation: u64) -> bool {
        let mut pending = self.pending_save();
        if pending.generation != generation || pending.handle.is_none() {
            return false;
        }
        pending.handle = None;
        true
    }
}

/// Mean of a source register, sampled only while a status register holds
/// the configured running value.
///
/// Every accepted sample schedules a save after `save_delay`; a newer sample
/// replaces the pending save rather than adding another one. Handles are
/// cheap to clone and share the same state.
#[derive(Clone)]
pub struct RunningAverage {
    inner: Arc<Inner>,
}

impl RunningAverage {
    pub async fn load(config: config::Average, storage_dir: &Path) -> Self {
        let store = AverageStore::new(storage_dir, config.key());
        let state = store.load().await;

        info!(
            "average {} loaded: count={} mean={:?}",
            config.key(),
            state.count,
            state.mean()
        );

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                state: Mutex::new(state),
                pending_save: Mutex::new(PendingSave::default()),
            }),
        }
    }

    pub async fn load_all(config: &ConfigWrapper) -> Vec<Self> {
        let dir = config.storage_dir();
        let mut r = Vec::new();
        for average in config.averages() {
            r.push(Self::load(average, &dir).await);
        }
        r
    }

    pub fn key(&self) -> &str {
        self.inner.config.key()
    }

    pub fn source(&self) -> &str {
        self.inner.config.source()
    }

    pub fn status(&self) -> &str {
        self.inner.config.status()
    }

    pub fn store_path(&self) -> &Path {
        self.inner.store.path()
    }

    /// Accepts `value` if `status` equals the running value. Returns whether
    /// the sample was counted. Non-finite values are never counted.
    pub fn record(&self, value: f64, status: &str) -> bool {
        if !value.is_finite() {
            warn!("average {}: ignoring non-finite sample {}", self.key(), value);
            return false;
        }

        let running = self.inner.config.running_value();
        if status.trim() != running {
            trace!(
                "average {}: status {} is not {}, ignoring {}",
                self.key(),
                status,
                running,
                value
            );
            return false;
        }

        self.inner.state().add(value);
        self.schedule_save();
        true
    }

    /// Samples the source and status registers from a fresh read. Returns
    /// false if either is missing or the source is not numeric.
    pub fn observe(&self, registers: &Registers) -> bool {
        let (Some(source), Some(status)) = (registers.get(self.source()), registers.get(self.status()))
        else {
            trace!("average {}: source or status not read yet", self.key());
            return false;
        };

        match source.value.as_f64() {
            Some(value) => self.record(value, &status.value.to_string()),
            None => {
                warn!("average {}: {} is not numeric: {}", self.key(), self.source(), source.value);
                false
            }
        }
    }

    /// Zeros the state and saves it straight away, dropping any pending
    /// delayed save.
    pub async fn reset(&self) -> Result<()> {
        self.inner.cancel_pending_save();
        *self.inner.state() = AverageState::default();
        info!("average {} reset", self.key());
        self.inner.persist().await
    }

    /// Mean rounded to the configured precision.
    pub fn current_mean(&self) -> Option<f64> {
        let factor = 10f64.powi(self.inner.config.precision() as i32);
        self.inner.state().mean().map(|m| (m * factor).round() / factor)
    }

    pub fn state(&self) -> AverageState {
        self.inner.state().clone()
    }

    /// Cancels the delayed save and writes the current state now.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel_pending_save();
        self.inner.persist().await?;
        info!("average {} flushed to {}", self.key(), self.store_path().display());
        Ok(())
    }

    fn schedule_save(&self) {
        let inner = self.inner.clone();
        let delay: Duration = self.inner.config.save_delay();

        let mut pending = self.inner.pending_save();
        pending.generation += 1;
        let generation = pending.generation;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.claim_pending_save(generation) {
                return;
            }
            if let Err(e) = inner.persist().await {
                error!("average {}: save failed: {}", inner.config.key(), e);
            }
        });

        if let Some(previous) = pending.handle.replace(handle) {
            previous.abort();
        }
    }
} // }}}
