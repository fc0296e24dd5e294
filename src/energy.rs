//! Cumulative charge/discharge energy per tracked key.
//!
//! Power samples are integrated over wall-clock time into two monotonic
//! kWh counters, persisted after every update so they survive restarts.
//! The file layout (`key -> {energy_in_kwh, energy_out_kwh, last_ts}`) is
//! compatible with existing counter files.

use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const STORAGE_FILE_NAME: &str = "bms_energy_counters.json";
/// Persistent data directory of the add-on container.
pub const DATA_DIR: &str = "/data";

const SECONDS_PER_HOUR: f64 = 3600.0;
const WH_PER_KWH: f64 = 1000.0;

fn timestamp_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

/// Persisted state of one tracked key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyState {
    #[serde(default)]
    pub energy_in_kwh: f64,
    #[serde(default)]
    pub energy_out_kwh: f64,
    /// Unix seconds of the last sample, 0 when never sampled.
    #[serde(default, rename = "last_ts")]
    pub last_sample_ts: f64,
}

impl EnergyState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            energy_in_kwh: 0.0,
            energy_out_kwh: 0.0,
            last_sample_ts: timestamp_seconds(now),
        }
    }

    pub fn totals(&self) -> EnergyTotals {
        EnergyTotals {
            energy_in_kwh: self.energy_in_kwh,
            energy_out_kwh: self.energy_out_kwh,
        }
    }

    pub fn last_sample(&self) -> Option<DateTime<Utc>> {
        if self.last_sample_ts <= 0.0 || !self.last_sample_ts.is_finite() {
            return None;
        }
        let secs = self.last_sample_ts.floor();
        let nanos = ((self.last_sample_ts - secs) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnergyTotals {
    pub energy_in_kwh: f64,
    pub energy_out_kwh: f64,
}

/// JSON file holding every tracked key, replaced atomically on save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyStore {
    path: PathBuf,
}

impl EnergyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses `explicit` when given, else the add-on data directory when it is
    /// writable, else the working directory.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        let data_dir = Path::new(DATA_DIR);
        if data_dir.is_dir() && tempfile::NamedTempFile::new_in(data_dir).is_ok() {
            return Self::new(data_dir.join(STORAGE_FILE_NAME));
        }
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(cwd.join(STORAGE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty state set.
    pub fn load(&self) -> Result<BTreeMap<String, EnergyState>, PersistenceError> {
        if !self.path.exists() {
            log::debug!("No energy counters at {:?}", self.path);
            return Ok(BTreeMap::new());
        }
        let file = std::fs::File::open(&self.path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn save(&self, states: &BTreeMap<String, EnergyState>) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, states)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

/// Integrates power into energy per key.
///
/// All keys share one lock; updates come from a single polling loop.
#[derive(Debug)]
pub struct EnergyIntegrator {
    store: Option<EnergyStore>,
    states: Mutex<BTreeMap<String, EnergyState>>,
}

impl EnergyIntegrator {
    /// Loads existing counters. A corrupt or unreadable file starts empty.
    pub fn open(store: EnergyStore) -> Self {
        let states = match store.load() {
            Ok(states) => {
                log::info!(
                    "Loaded energy counters for {} keys from {:?}",
                    states.len(),
                    store.path()
                );
                states
            }
            Err(err) => {
                log::warn!(
                    "Cannot load energy counters from {:?}, starting empty: {err}",
                    store.path()
                );
                BTreeMap::new()
            }
        };
        Self {
            store: Some(store),
            states: Mutex::new(states),
        }
    }

    /// Counters that are never written anywhere.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, EnergyState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, states: &BTreeMap<String, EnergyState>) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(states) {
                // the in-memory counters stay authoritative, the next save catches up
                log::warn!("Cannot save energy counters to {:?}: {err}", store.path());
            }
        }
    }

    /// Integrates `power_w` (positive = charging) since the previous sample
    /// of `key` and returns the totals after the update.
    ///
    /// The first sample of a key only starts tracking. A clock that moved
    /// backwards contributes nothing.
    pub fn update(&self, key: &str, power_w: f64, now: DateTime<Utc>) -> EnergyTotals {
        let mut states = self.lock();
        let now_ts = timestamp_seconds(now);

        let totals = match states.get_mut(key) {
            None => {
                log::debug!("Start tracking energy for '{key}'");
                let state = EnergyState::fresh(now);
                states.insert(key.to_string(), state);
                state.totals()
            }
            Some(state) => {
                let dt = if state.last_sample_ts > 0.0 {
                    (now_ts - state.last_sample_ts).max(0.0)
                } else {
                    0.0
                };
                if dt > 0.0 && power_w.is_finite() {
                    let kwh = power_w * dt / SECONDS_PER_HOUR / WH_PER_KWH;
                    if kwh > 0.0 {
                        state.energy_in_kwh += kwh;
                    } else if kwh < 0.0 {
                        state.energy_out_kwh += -kwh;
                    }
                    log::trace!("'{key}': {power_w:.1}W over {dt:.1}s = {kwh:.6}kWh");
                }
                state.last_sample_ts = now_ts;
                state.totals()
            }
        };

        self.persist(&states);
        totals
    }

    /// Zeroes the counters of `key` and restarts its timestamp at `now`.
    pub fn reset(&self, key: &str, now: DateTime<Utc>) -> EnergyTotals {
        let mut states = self.lock();
        let state = EnergyState::fresh(now);
        states.insert(key.to_string(), state);
        log::info!("Energy counters for '{key}' reset");
        self.persist(&states);
        state.totals()
    }

    pub fn state(&self, key: &str) -> Option<EnergyState> {
        self.lock().get(key).copied()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}
