//! Trip persistence and id allocation
//!
//! `JsonlTripStore` appends one JSON object per event to `trips.jsonl`;
//! `SequenceAllocator` hands out trip/block ids from ranges reserved in
//! `sequences.json`, so ids never repeat across restarts.

use crate::domain::trip::{IgnoreReason, TripRecord};
use crate::domain::types::{BlockId, TripId};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Persistence contract used by the poller and the finalizers
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Store the trip record and its reports
    async fn save_trip(&self, record: &TripRecord) -> anyhow::Result<()>;

    /// Mark reports (by sequence) as ignored by error correction
    async fn ignore_reports(&self, trip_id: TripId, sequences: &[u32]) -> anyhow::Result<()>;

    /// Discard the trip with a reason
    async fn ignore_trip(&self, trip_id: TripId, reason: IgnoreReason) -> anyhow::Result<()>;

    async fn flag_trip(&self, trip_id: TripId, problem: &str) -> anyhow::Result<()>;

    async fn store_match(&self, trip_id: TripId, confidence: f64, geometry: &[[f64; 2]])
        -> anyhow::Result<()>;

    async fn store_stop_time(&self, trip_id: TripId, stop_id: &str, time: f64) -> anyhow::Result<()>;

    /// Mark the trip complete
    async fn finish_trip(&self, trip_id: TripId) -> anyhow::Result<()>;

    /// Latest saved record of a trip, if any
    async fn load_trip(&self, trip_id: TripId) -> anyhow::Result<Option<TripRecord>>;
}

/// Process-wide unique id generation
pub trait IdAllocator: Send + Sync {
    fn next_trip_id(&self) -> anyhow::Result<TripId>;
    fn next_block_id(&self) -> anyhow::Result<BlockId>;
}

/// One line of `trips.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StoreEvent {
    Saved { trip: TripRecord },
    ReportsIgnored { trip_id: TripId, sequences: Vec<u32> },
    Ignored { trip_id: TripId, reason: String },
    Flagged { trip_id: TripId, problem: String },
    Matched { trip_id: TripId, confidence: f64, geometry: Vec<[f64; 2]> },
    StopTime { trip_id: TripId, stop_id: String, time: f64 },
    Finished { trip_id: TripId },
}

/// Append-only JSON-lines trip store
pub struct JsonlTripStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTripStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create store dir {}", dir.display()))?;
        let path = dir.join("trips.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        info!(file = %path.display(), "trip_store_opened");
        Ok(Self { path, file: Mutex::new(file) })
    }

    fn append(&self, event: &StoreEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        debug!(file = %self.path.display(), bytes = %line.len(), "store_written");
        Ok(())
    }
}

#[async_trait]
impl TripStore for JsonlTripStore {
    async fn save_trip(&self, record: &TripRecord) -> anyhow::Result<()> {
        self.append(&StoreEvent::Saved { trip: record.clone() })
    }

    async fn ignore_reports(&self, trip_id: TripId, sequences: &[u32]) -> anyhow::Result<()> {
        if sequences.is_empty() {
            return Ok(());
        }
        self.append(&StoreEvent::ReportsIgnored { trip_id, sequences: sequences.to_vec() })
    }

    async fn ignore_trip(&self, trip_id: TripId, reason: IgnoreReason) -> anyhow::Result<()> {
        self.append(&StoreEvent::Ignored { trip_id, reason: reason.as_str().to_string() })
    }

    async fn flag_trip(&self, trip_id: TripId, problem: &str) -> anyhow::Result<()> {
        self.append(&StoreEvent::Flagged { trip_id, problem: problem.to_string() })
    }

    async fn store_match(
        &self,
        trip_id: TripId,
        confidence: f64,
        geometry: &[[f64; 2]],
    ) -> anyhow::Result<()> {
        self.append(&StoreEvent::Matched { trip_id, confidence, geometry: geometry.to_vec() })
    }

    async fn store_stop_time(&self, trip_id: TripId, stop_id: &str, time: f64) -> anyhow::Result<()> {
        self.append(&StoreEvent::StopTime { trip_id, stop_id: stop_id.to_string(), time })
    }

    async fn finish_trip(&self, trip_id: TripId) -> anyhow::Result<()> {
        self.append(&StoreEvent::Finished { trip_id })
    }

    async fn load_trip(&self, trip_id: TripId) -> anyhow::Result<Option<TripRecord>> {
        let file =
            File::open(&self.path).with_context(|| format!("Failed to open {}", self.path.display()))?;

        let mut found = None;
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: StoreEvent = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: malformed record", self.path.display(), n + 1))?;
            if let StoreEvent::Saved { trip } = event {
                if trip.trip_id == trip_id {
                    found = Some(trip);
                }
            }
        }
        Ok(found)
    }
}

/// Ids handed out per reservation
pub const RESERVE_BLOCK: u64 = 100;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SequenceFile {
    /// First trip id not covered by any reservation
    trip: u64,
    block: u64,
}

#[derive(Debug)]
struct Sequence {
    next: u64,
    ceiling: u64,
}

impl Sequence {
    fn resume(ceiling: u64) -> Self {
        let start = ceiling.max(1);
        Self { next: start, ceiling: start }
    }
}

#[derive(Debug)]
struct SequenceState {
    trip: Sequence,
    block: Sequence,
}

/// File-backed id sequences with reserved ranges.
///
/// Only the ceiling of each range is persisted; ids between the last handed
/// out and the ceiling are skipped after a restart.
pub struct SequenceAllocator {
    path: PathBuf,
    reserve: u64,
    state: Mutex<SequenceState>,
}

impl SequenceAllocator {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        Self::with_reserve(dir, RESERVE_BLOCK)
    }

    pub fn with_reserve<P: AsRef<Path>>(dir: P, reserve: u64) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create store dir {}", dir.display()))?;
        let path = dir.join("sequences.json");

        let stored = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<SequenceFile>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            SequenceFile::default()
        };

        info!(trip = %stored.trip, block = %stored.block, "sequences_resumed");
        Ok(Self {
            path,
            reserve: reserve.max(1),
            state: Mutex::new(SequenceState {
                trip: Sequence::resume(stored.trip),
                block: Sequence::resume(stored.block),
            }),
        })
    }

    fn persist(&self, state: &SequenceState) -> anyhow::Result<()> {
        let content = serde_json::to_string(&SequenceFile {
            trip: state.trip.ceiling,
            block: state.block.ceiling,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn next(&self, pick: fn(&mut SequenceState) -> &mut Sequence) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let seq = pick(&mut state);
        if seq.next >= seq.ceiling {
            let previous = seq.ceiling;
            seq.ceiling = seq.next + self.reserve;
            if let Err(e) = self.persist(&state) {
                pick(&mut state).ceiling = previous;
                return Err(e);
            }
        }
        let seq = pick(&mut state);
        let id = seq.next;
        seq.next += 1;
        Ok(id)
    }
}

impl IdAllocator for SequenceAllocator {
    fn next_trip_id(&self) -> anyhow::Result<TripId> {
        self.next(|s| &mut s.trip).map(TripId)
    }

    fn next_block_id(&self) -> anyhow::Result<BlockId> {
        self.next(|s| &mut s.block).map(BlockId)
    }
}

/// What the memory store knows about one trip
#[derive(Debug, Clone, Default)]
pub struct StoredTrip {
    pub record: Option<TripRecord>,
    pub ignored_sequences: Vec<u32>,
    pub ignore_reason: Option<IgnoreReason>,
    pub problems: Vec<String>,
    pub match_confidence: Option<f64>,
    pub match_geometry: Vec<[f64; 2]>,
    pub stop_times: Vec<(String, f64)>,
    pub finished: bool,
}

/// In-memory store and id source for tests and dry runs
#[derive(Debug)]
pub struct MemoryTripStore {
    trips: Mutex<FxHashMap<TripId, StoredTrip>>,
    next_trip: AtomicU64,
    next_block: AtomicU64,
    fail_allocation: AtomicBool,
}

impl Default for MemoryTripStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTripStore {
    pub fn new() -> Self {
        Self {
            trips: Mutex::new(FxHashMap::default()),
            next_trip: AtomicU64::new(1),
            next_block: AtomicU64::new(1),
            fail_allocation: AtomicBool::new(false),
        }
    }

    /// Make id allocation fail until reset
    pub fn set_fail_allocation(&self, fail: bool) {
        self.fail_allocation.store(fail, Ordering::Relaxed);
    }

    pub fn trip(&self, trip_id: TripId) -> Option<StoredTrip> {
        self.trips.lock().get(&trip_id).cloned()
    }

    pub fn trip_count(&self) -> usize {
        self.trips.lock().len()
    }

    fn update(&self, trip_id: TripId, f: impl FnOnce(&mut StoredTrip)) {
        f(self.trips.lock().entry(trip_id).or_default());
    }

    fn allocate(&self, counter: &AtomicU64) -> anyhow::Result<u64> {
        if self.fail_allocation.load(Ordering::Relaxed) {
            anyhow::bail!("id allocation unavailable");
        }
        Ok(counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl TripStore for MemoryTripStore {
    async fn save_trip(&self, record: &TripRecord) -> anyhow::Result<()> {
        self.update(record.trip_id, |t| t.record = Some(record.clone()));
        Ok(())
    }

    async fn ignore_reports(&self, trip_id: TripId, sequences: &[u32]) -> anyhow::Result<()> {
        self.update(trip_id, |t| t.ignored_sequences.extend_from_slice(sequences));
        Ok(())
    }

    async fn ignore_trip(&self, trip_id: TripId, reason: IgnoreReason) -> anyhow::Result<()> {
        self.update(trip_id, |t| t.ignore_reason = Some(reason));
        Ok(())
    }

    async fn flag_trip(&self, trip_id: TripId, problem: &str) -> anyhow::Result<()> {
        self.update(trip_id, |t| t.problems.push(problem.to_string()));
        Ok(())
    }

    async fn store_match(
        &self,
        trip_id: TripId,
        confidence: f64,
        geometry: &[[f64; 2]],
    ) -> anyhow::Result<()> {
        self.update(trip_id, |t| {
            t.match_confidence = Some(confidence);
            t.match_geometry = geometry.to_vec();
        });
        Ok(())
    }

    async fn store_stop_time(&self, trip_id: TripId, stop_id: &str, time: f64) -> anyhow::Result<()> {
        self.update(trip_id, |t| t.stop_times.push((stop_id.to_string(), time)));
        Ok(())
    }

    async fn finish_trip(&self, trip_id: TripId) -> anyhow::Result<()> {
        self.update(trip_id, |t| t.finished = true);
        Ok(())
    }

    async fn load_trip(&self, trip_id: TripId) -> anyhow::Result<Option<TripRecord>> {
        Ok(self.trips.lock().get(&trip_id).and_then(|t| t.record.clone()))
    }
}

impl IdAllocator for MemoryTripStore {
    fn next_trip_id(&self) -> anyhow::Result<TripId> {
        self.allocate(&self.next_trip).map(TripId)
    }

    fn next_block_id(&self) -> anyhow::Result<BlockId> {
        self.allocate(&self.next_block).map(BlockId)
    }
}
