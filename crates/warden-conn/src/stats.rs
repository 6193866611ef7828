use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsEntry {
    pub address: String,
    pub duration: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error: Option<String>,
}

pub trait Tracker: Send + Sync {
    fn record_dial(&self, address: &str, success: bool);
    fn record_stats(&self, entry: StatsEntry);
}

#[derive(Debug, Default)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn record_dial(&self, _address: &str, _success: bool) {}
    fn record_stats(&self, _entry: StatsEntry) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecTracker {
    dials: Arc<Mutex<Vec<(String, bool)>>>,
    stats: Arc<Mutex<Vec<StatsEntry>>>,
}

impl VecTracker {
    pub fn dials(&self) -> Vec<(String, bool)> {
        self.dials.lock().expect("dials lock poisoned").clone()
    }

    pub fn stats(&self) -> Vec<StatsEntry> {
        self.stats.lock().expect("stats lock poisoned").clone()
    }
}

impl Tracker for VecTracker {
    fn record_dial(&self, address: &str, success: bool) {
        self.dials
            .lock()
            .expect("dials lock poisoned")
            .push((address.to_string(), success));
    }

    fn record_stats(&self, entry: StatsEntry) {
        self.stats.lock().expect("stats lock poisoned").push(entry);
    }
}
