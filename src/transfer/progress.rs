//! Aggregated per-transfer progress
//!
//! Chunk tasks report partial byte counts as data arrives; completed chunks
//! fold into `done`. Updates for one transfer are rate-limited so a fast
//! stream does not flood subscribers, but completion always reports.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::events::ProgressUpdate;
use super::TransferId;

const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Moving-window throughput estimate
#[derive(Debug, Default)]
pub struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn record(&mut self, now: Instant, loaded: u64) {
        if let Some(&(_, last)) = self.samples.back() {
            if loaded < last {
                // in-flight bytes were discarded; restart the window
                self.samples.clear();
            }
        }
        self.samples.push_back((now, loaded));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second; zero until two samples exist
    pub fn rate(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, b0)), Some(&(t1, b1))) if t1 > t0 => {
                (b1 - b0) as f64 / t1.duration_since(t0).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

#[derive(Debug)]
struct ProgressEntry {
    total: u64,
    done: u64,
    position: u64,
    inflight: HashMap<u64, u64>,
    speed: SpeedMeter,
    last_emit: Option<Instant>,
}

impl ProgressEntry {
    fn loaded(&self) -> u64 {
        (self.done + self.inflight.values().sum::<u64>()).min(self.total)
    }

    fn update(&self, id: TransferId) -> ProgressUpdate {
        let loaded = self.loaded();
        let percent = if self.total == 0 {
            100.0
        } else {
            loaded as f64 * 100.0 / self.total as f64
        };
        ProgressUpdate {
            id,
            percent,
            loaded,
            total: self.total,
            speed: self.speed.rate(),
            position: self.position,
        }
    }
}

/// Progress of every active transfer
#[derive(Debug)]
pub struct ProgressTable {
    entries: Mutex<HashMap<TransferId, ProgressEntry>>,
    interval: Duration,
}

impl ProgressTable {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Start tracking, crediting bytes already durable from a resume
    pub fn register(&self, id: TransferId, total: u64, already_done: u64) {
        self.entries.lock().insert(
            id,
            ProgressEntry {
                total,
                done: already_done.min(total),
                position: already_done.min(total),
                inflight: HashMap::new(),
                speed: SpeedMeter::default(),
                last_emit: None,
            },
        );
    }

    /// Partial bytes for the chunk at `offset`
    pub fn chunk_progress(&self, id: TransferId, offset: u64, loaded: u64) -> Option<ProgressUpdate> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        entry.inflight.insert(offset, loaded);
        let now = Instant::now();
        let total = entry.loaded();
        entry.speed.record(now, total);
        self.throttled(id, entry, now, false)
    }

    /// Chunk fully transferred
    pub fn chunk_done(&self, id: TransferId, offset: u64, size: u64) -> Option<ProgressUpdate> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        entry.inflight.remove(&offset);
        entry.done = (entry.done + size).min(entry.total);
        let now = Instant::now();
        let total = entry.loaded();
        entry.speed.record(now, total);
        let force = entry.done == entry.total;
        self.throttled(id, entry, now, force)
    }

    /// Discard in-flight bytes of an aborted or retried chunk
    pub fn chunk_reset(&self, id: TransferId, offset: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.inflight.remove(&offset);
        }
    }

    /// Record the durable byte offset
    pub fn set_position(&self, id: TransferId, position: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.position = position;
        }
    }

    pub fn snapshot(&self, id: TransferId) -> Option<ProgressUpdate> {
        self.entries.lock().get(&id).map(|entry| entry.update(id))
    }

    pub fn remove(&self, id: TransferId) {
        self.entries.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn throttled(
        &self,
        id: TransferId,
        entry: &mut ProgressEntry,
        now: Instant,
        force: bool,
    ) -> Option<ProgressUpdate> {
        let due = entry
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if force || due {
            entry.last_emit = Some(now);
            Some(entry.update(id))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_includes_inflight() {
        let table = ProgressTable::new(Duration::ZERO);
        let id = TransferId(1);
        table.register(id, 1000, 0);

        let update = table.chunk_progress(id, 0, 100).unwrap();
        assert_eq!(update.loaded, 100);
        let update = table.chunk_progress(id, 500, 50).unwrap();
        assert_eq!(update.loaded, 150);

        let update = table.chunk_done(id, 0, 500).unwrap();
        assert_eq!(update.loaded, 550);
        assert!((update.percent - 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset_discards_inflight() {
        let table = ProgressTable::new(Duration::ZERO);
        let id = TransferId(2);
        table.register(id, 100, 0);
        table.chunk_progress(id, 0, 40);
        table.chunk_reset(id, 0);
        assert_eq!(table.snapshot(id).unwrap().loaded, 0);
    }

    #[test]
    fn test_rate_limit_but_completion_forced() {
        let table = ProgressTable::new(Duration::from_secs(3600));
        let id = TransferId(3);
        table.register(id, 100, 0);

        assert!(table.chunk_progress(id, 0, 10).is_some());
        assert!(table.chunk_progress(id, 0, 20).is_none());
        let last = table.chunk_done(id, 0, 100).unwrap();
        assert_eq!(last.loaded, 100);
        assert!((last.percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resumed_bytes_credited() {
        let table = ProgressTable::new(Duration::ZERO);
        let id = TransferId(4);
        table.register(id, 1000, 400);
        let snap = table.snapshot(id).unwrap();
        assert_eq!(snap.loaded, 400);
        assert_eq!(snap.position, 400);
    }

    #[test]
    fn test_unknown_transfer() {
        let table = ProgressTable::new(Duration::ZERO);
        assert!(table.chunk_progress(TransferId(9), 0, 1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_speed_meter() {
        let mut meter = SpeedMeter::default();
        let start = Instant::now();
        meter.record(start, 0);
        assert_eq!(meter.rate(), 0.0);
        meter.record(start + Duration::from_secs(2), 2000);
        assert!((meter.rate() - 1000.0).abs() < 1e-6);
        meter.record(start + Duration::from_secs(3), 100);
        assert_eq!(meter.rate(), 0.0);
    }
}
