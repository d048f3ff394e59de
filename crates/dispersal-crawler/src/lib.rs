// crates/dispersal-crawler/src/lib.rs

//! A persistent, rate-limited traversal of a prefix-sharded share directory.
//!
//! The share tree is flat and two levels deep: 1024 fixed prefix
//! directories, each holding some number of bucket directories. A
//! [`Crawler`] walks prefixes in sorted order, listing (and caching) each
//! prefix's buckets once, invoking a [`CrawlerHooks`] callback per bucket.
//! Progress is checkpointed to a statefile after every bucket, prefix, and
//! completed cycle, so a crawler killed mid-walk resumes close to where it
//! left off. Wall-clock is supplied by a [`Clock`] so tests can simulate
//! time without sleeping.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Use up to this fraction of wall-clock time, on average.
pub const DEFAULT_ALLOWED_CPU_PERCENTAGE: f64 = 0.10;
/// Run for up to this long before yielding back to the scheduler.
pub const DEFAULT_CPU_SLICE: Duration = Duration::from_secs(1);
/// Never start a new cycle faster than this after the previous one finished.
pub const DEFAULT_MINIMUM_CYCLE_TIME: Duration = Duration::from_secs(300);
/// Upper bound on any single scheduled sleep, regardless of the formula below.
const MAX_SLEEP: Duration = Duration::from_secs(299);

/// A source of wall-clock time, abstracted so tests can simulate the passage
/// of time instead of actually sleeping.
pub trait Clock {
    /// Seconds elapsed since an arbitrary, monotonic epoch.
    fn now_secs(&self) -> f64;
}

/// A [`Clock`] backed by the real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is after the unix epoch")
            .as_secs_f64()
    }
}

/// Raised internally when a slice's CPU budget is exhausted. Caught at the
/// slice boundary in [`Crawler::walk_current_cycle`]; it never escapes
/// [`Crawler::run_slice`].
#[derive(Debug)]
struct TimeSliceExceeded;

/// Callback surface a crawler user implements; a handler record rather than
/// a base class to subclass, since the core has no inheritance.
pub trait CrawlerHooks {
    /// Called once per bucket, in `(prefix, bucket)` order within a cycle.
    ///
    /// May be invoked a second time for the last bucket of a prior,
    /// interrupted incarnation (see "Restart semantics" on [`Crawler`]);
    /// implementations must be idempotent.
    fn process_bucket(&mut self, cycle: u64, prefix: &str, prefix_path: &Path, bucket: &str);

    /// Called once a full cycle (all 1024 prefixes) has been traversed.
    fn finished_cycle(&mut self, _cycle: u64) {}

    /// Called just before the crawler sleeps, mostly for test observation.
    fn yielding(&mut self, _sleep: Duration) {}
}

/// Tunable pacing knobs, all of which may be changed between slices.
#[derive(Clone, Copy, Debug)]
pub struct CrawlerConfig {
    /// Target fraction of wall-clock time spent working, averaged over a slice.
    pub allowed_cpu_percentage: f64,
    /// Maximum duration of one slice before it raises [`TimeSliceExceeded`].
    pub cpu_slice: Duration,
    /// A new cycle never starts sooner than this after the last one finished.
    pub minimum_cycle_time: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            allowed_cpu_percentage: DEFAULT_ALLOWED_CPU_PERCENTAGE,
            cpu_slice: DEFAULT_CPU_SLICE,
            minimum_cycle_time: DEFAULT_MINIMUM_CYCLE_TIME,
        }
    }
}

/// The crawler's persisted progress, opaque beyond these keys plus whatever
/// a caller stashes in `extra`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CrawlerState {
    /// Statefile format version; always 1.
    pub version: u32,
    /// The cycle number of the last fully completed traversal, if any.
    pub last_cycle_finished: Option<u64>,
    /// The cycle currently in progress, or `None` while sleeping between cycles.
    pub current_cycle: Option<u64>,
    /// Two-character prefix of the last prefix directory fully processed in
    /// this cycle, or `None` if none has completed yet (or between cycles).
    pub last_complete_prefix: Option<String>,
    /// Base32 bucket name of the last bucket processed, or `None` between cycles.
    pub last_complete_bucket: Option<String>,
    /// Open-ended subclass-extension keys, preserved verbatim across saves.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CrawlerState {
    fn fresh() -> Self {
        Self {
            version: 1,
            last_cycle_finished: None,
            current_cycle: Some(0),
            last_complete_prefix: None,
            last_complete_bucket: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// The 1024 two-character base32 prefixes, in sorted order: `i` shifted into
/// the top 10 bits of a 16-bit field, base32-encoded, lowercased, truncated
/// to two characters. Fixed and process-wide.
#[must_use]
pub fn prefixes() -> Vec<String> {
    let mut ps: Vec<String> = (0u16..1024)
        .map(|i| {
            let field: u16 = i << 6; // top 10 bits of 16 occupied, i in [0, 1024)
            let bytes = field.to_be_bytes();
            let enc = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
                .to_ascii_lowercase();
            enc.chars().take(2).collect::<String>()
        })
        .collect();
    ps.sort();
    ps
}

/// Reports how one slice ended: it either ran out of prefixes (the cycle
/// completed) or ran out of time.
#[derive(Debug, Eq, PartialEq)]
enum SliceOutcome {
    CycleFinished,
    TimeSliceExceeded,
}

/// Drives one rate-limited traversal of `sharedir`'s prefix directories.
///
/// **Restart semantics.** If killed mid-bucket, `process_bucket` may be
/// invoked a second time on restart for the last bucket of the previous
/// incarnation, since state changes from that bucket were never persisted —
/// this is why [`CrawlerHooks::process_bucket`] must be idempotent.
///
/// **Shared resources.** The statefile is the crawler's only persistent
/// resource, written atomically (`.tmp` then rename). Two crawlers sharing
/// one statefile have undefined behavior.
pub struct Crawler<C: Clock = SystemClock> {
    sharedir: PathBuf,
    statefile: PathBuf,
    config: CrawlerConfig,
    clock: C,
    prefixes: Vec<String>,
    state: CrawlerState,
    last_complete_prefix_index: i64,
    bucket_cache: Option<(usize, Vec<String>)>,
}

impl Crawler<SystemClock> {
    /// Construct a crawler over `sharedir`, persisting progress to `statefile`.
    ///
    /// # Errors
    /// Returns an error if an existing statefile can't be parsed, or names a
    /// `last_complete_prefix` that isn't one of the 1024 known prefixes.
    pub fn new(sharedir: PathBuf, statefile: PathBuf, config: CrawlerConfig) -> Result<Self> {
        Self::with_clock(sharedir, statefile, config, SystemClock)
    }
}

impl<C: Clock> Crawler<C> {
    /// Construct a crawler with an injected [`Clock`], for deterministic tests.
    ///
    /// # Errors
    /// See [`Crawler::new`].
    pub fn with_clock(
        sharedir: PathBuf,
        statefile: PathBuf,
        config: CrawlerConfig,
        clock: C,
    ) -> Result<Self> {
        let state = load_state(&statefile)?;
        let prefixes = prefixes();
        let last_complete_prefix_index = match &state.last_complete_prefix {
            None => -1,
            Some(p) => prefixes
                .iter()
                .position(|x| x == p)
                .context("statefile's last_complete_prefix is not a known prefix")?
                as i64,
        };
        Ok(Self {
            sharedir,
            statefile,
            config,
            clock,
            prefixes,
            state,
            last_complete_prefix_index,
            bucket_cache: None,
        })
    }

    /// A copy of the current persisted state, for status reporting.
    #[must_use]
    pub fn state(&self) -> CrawlerState {
        self.state.clone()
    }

    /// Run one rate-limited slice of work against `hooks`, then return the
    /// duration the caller should wait before calling again.
    ///
    /// # Errors
    /// Propagates filesystem errors writing the statefile; a single failed
    /// checkpoint write is logged and does not abort the slice, since it
    /// will be retried at the next checkpoint. Errors *listing* a prefix
    /// directory are swallowed entirely (treated as an empty bucket list).
    pub fn run_slice(&mut self, hooks: &mut dyn CrawlerHooks) -> Result<Duration> {
        let start = self.clock.now_secs();
        let outcome = match self.walk_current_cycle(start, hooks) {
            Ok(()) => SliceOutcome::CycleFinished,
            Err(TimeSliceExceeded) => SliceOutcome::TimeSliceExceeded,
        };

        let now = self.clock.now_secs();
        let this_slice = (now - start).max(0.0);
        // this_slice / (this_slice + sleep) = allowed_cpu_percentage
        let work_based = this_slice / self.config.allowed_cpu_percentage - this_slice;
        let mut sleep_secs = work_based.clamp(0.0, MAX_SLEEP.as_secs_f64());

        if outcome == SliceOutcome::CycleFinished {
            sleep_secs = sleep_secs.max(self.config.minimum_cycle_time.as_secs_f64());
        }
        let sleep = Duration::from_secs_f64(sleep_secs);
        debug!(
            this_slice,
            sleep_secs,
            cycle_finished = outcome == SliceOutcome::CycleFinished,
            "slice ended"
        );
        hooks.yielding(sleep);
        Ok(sleep)
    }

    /// Resume (or start) the current cycle, processing prefixes until either
    /// the whole cycle completes or the slice's CPU budget is exhausted.
    fn walk_current_cycle(
        &mut self,
        start: f64,
        hooks: &mut dyn CrawlerHooks,
    ) -> Result<(), TimeSliceExceeded> {
        if self.state.current_cycle.is_none() {
            let finished = self
                .state
                .last_cycle_finished
                .expect("current_cycle is only None once a cycle has finished");
            self.state.current_cycle = Some(finished + 1);
        }
        let cycle = self.state.current_cycle.expect("just ensured Some");

        let start_index = usize::try_from(self.last_complete_prefix_index + 1).unwrap_or(0);
        for i in start_index..self.prefixes.len() {
            if self.clock.now_secs() - start > self.config.cpu_slice.as_secs_f64() {
                return Err(TimeSliceExceeded);
            }
            let prefix = self.prefixes[i].clone();
            let prefix_path = self.sharedir.join(&prefix);
            let buckets = self.buckets_for(i, &prefix_path);

            self.process_prefix(cycle, &prefix, &prefix_path, &buckets, start, hooks)?;

            self.last_complete_prefix_index = i as i64;
            self.state.last_complete_prefix = Some(prefix);
            if let Err(e) = self.save_state() {
                warn!(error = %e, "failed to checkpoint statefile after prefix");
            }
        }

        self.last_complete_prefix_index = -1;
        self.state.last_complete_bucket = None;
        self.state.last_complete_prefix = None;
        self.state.last_cycle_finished = Some(cycle);
        self.state.current_cycle = None;
        hooks.finished_cycle(cycle);
        if let Err(e) = self.save_state() {
            warn!(error = %e, "failed to checkpoint statefile after cycle");
        }
        info!(cycle, "crawl cycle finished");
        Ok(())
    }

    /// List `prefix_path`'s buckets (sorted), reusing the cache if this is
    /// the prefix it was last populated for. Listing errors are swallowed
    /// into an empty bucket list, per contract.
    fn buckets_for(&mut self, index: usize, prefix_path: &Path) -> Vec<String> {
        if let Some((cached_index, buckets)) = &self.bucket_cache {
            if *cached_index == index {
                return buckets.clone();
            }
        }
        let mut buckets: Vec<String> = match fs::read_dir(prefix_path) {
            Ok(entries) => entries
                .filter_map(std::result::Result::ok)
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        buckets.sort();
        self.bucket_cache = Some((index, buckets.clone()));
        buckets
    }

    fn process_prefix(
        &mut self,
        cycle: u64,
        prefix: &str,
        prefix_path: &Path,
        buckets: &[String],
        start: f64,
        hooks: &mut dyn CrawlerHooks,
    ) -> Result<(), TimeSliceExceeded> {
        for bucket in buckets {
            if let Some(last) = &self.state.last_complete_bucket {
                if bucket <= last {
                    continue;
                }
            }
            if self.clock.now_secs() - start > self.config.cpu_slice.as_secs_f64() {
                return Err(TimeSliceExceeded);
            }
            hooks.process_bucket(cycle, prefix, prefix_path, bucket);
            self.state.last_complete_bucket = Some(bucket.clone());
            if let Err(e) = self.save_state() {
                warn!(error = %e, "failed to checkpoint statefile after bucket");
            }
        }
        Ok(())
    }

    fn save_state(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state).context("serialize crawler state")?;
        dispersal_core::io::write_atomic(&self.statefile, &bytes)
    }
}

fn load_state(statefile: &Path) -> Result<CrawlerState> {
    match fs::read(statefile) {
        Ok(bytes) => serde_json::from_slice(&bytes).context("parse crawler statefile"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CrawlerState::fresh()),
        Err(e) => Err(e).context("read crawler statefile"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;

    struct FakeClock(Cell<f64>);

    impl Clock for FakeClock {
        fn now_secs(&self) -> f64 {
            self.0.get()
        }
    }

    impl FakeClock {
        fn advance(&self, secs: f64) {
            self.0.set(self.0.get() + secs);
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        visited: Vec<(u64, String, String)>,
        cycles_finished: Vec<u64>,
    }

    impl CrawlerHooks for RecordingHooks {
        fn process_bucket(&mut self, cycle: u64, prefix: &str, _prefix_path: &Path, bucket: &str) {
            self.visited.push((cycle, prefix.to_string(), bucket.to_string()));
        }
        fn finished_cycle(&mut self, cycle: u64) {
            self.cycles_finished.push(cycle);
        }
    }

    struct NoopHooks;
    impl CrawlerHooks for NoopHooks {
        fn process_bucket(&mut self, _cycle: u64, _prefix: &str, _prefix_path: &Path, _bucket: &str) {}
    }

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("dispersal_crawler_{name}_{nanos}"));
        p
    }

    fn make_bucket(sharedir: &Path, prefix: &str, bucket: &str) {
        let dir = sharedir.join(prefix).join(bucket);
        fs::create_dir_all(dir).unwrap();
    }

    #[test]
    fn prefixes_are_1024_sorted_two_char_strings() {
        let ps = prefixes();
        assert_eq!(ps.len(), 1024);
        let mut sorted = ps.clone();
        sorted.sort();
        assert_eq!(ps, sorted);
        assert!(ps.iter().all(|p| p.chars().count() == 2));
        assert_eq!(
            ps.iter().collect::<std::collections::HashSet<_>>().len(),
            1024
        );
    }

    #[test]
    fn one_full_cycle_visits_every_bucket_exactly_once() {
        let sharedir = tmp_dir("cycle");
        let statefile = tmp_dir("cycle_state");
        let ps = prefixes();
        make_bucket(&sharedir, &ps[0], "buckaaa");
        make_bucket(&sharedir, &ps[0], "buckbbb");
        make_bucket(&sharedir, &ps[500], "buckccc");

        let clock = FakeClock(Cell::new(0.0));
        let config = CrawlerConfig {
            allowed_cpu_percentage: 0.10,
            cpu_slice: Duration::from_secs(3600), // never time out in this test
            minimum_cycle_time: Duration::ZERO,
        };
        let mut crawler = Crawler::with_clock(sharedir.clone(), statefile, config, clock).unwrap();

        let mut hooks = RecordingHooks::default();
        crawler.run_slice(&mut hooks).unwrap();

        assert_eq!(hooks.visited.len(), 3);
        assert_eq!(hooks.cycles_finished, vec![0]);
        assert_eq!(crawler.state().last_cycle_finished, Some(0));
        assert_eq!(crawler.state().current_cycle, None);

        let _ = fs::remove_dir_all(&sharedir);
    }

    #[test]
    fn time_slice_exceeded_resumes_from_checkpoint_next_slice() {
        let sharedir = tmp_dir("resume");
        let statefile = tmp_dir("resume_state");
        let ps = prefixes();
        make_bucket(&sharedir, &ps[0], "b0");
        make_bucket(&sharedir, &ps[1], "b1");
        make_bucket(&sharedir, &ps[2], "b2");

        let config = CrawlerConfig {
            allowed_cpu_percentage: 0.10,
            cpu_slice: Duration::from_millis(1),
            minimum_cycle_time: Duration::ZERO,
        };
        let clock = FakeClock(Cell::new(10.0)); // already "past" the slice budget
        let mut crawler =
            Crawler::with_clock(sharedir.clone(), statefile.clone(), config, clock).unwrap();

        let mut hooks = RecordingHooks::default();
        crawler.run_slice(&mut hooks).unwrap();
        assert!(hooks.visited.is_empty());
        assert!(hooks.cycles_finished.is_empty());
        drop(crawler);

        // A fresh crawler loaded from the checkpoint, given a clock that
        // never advances past the slice budget, drains the whole cycle in
        // one slice (the per-bucket clock check only compares against the
        // *start* of this slice, which is always "now").
        let config2 = CrawlerConfig {
            allowed_cpu_percentage: 0.10,
            cpu_slice: Duration::from_secs(3600),
            minimum_cycle_time: Duration::ZERO,
        };
        let clock2 = FakeClock(Cell::new(0.0));
        let mut crawler2 =
            Crawler::with_clock(sharedir.clone(), statefile, config2, clock2).unwrap();
        crawler2.run_slice(&mut hooks).unwrap();
        assert_eq!(hooks.visited.len(), 3);
        assert_eq!(hooks.cycles_finished, vec![0]);

        let _ = fs::remove_dir_all(&sharedir);
    }

    #[test]
    fn sleep_formula_matches_allowed_cpu_percentage() {
        let sharedir = tmp_dir("sleep");
        let statefile = tmp_dir("sleep_state");
        let clock = FakeClock(Cell::new(0.0));
        let config = CrawlerConfig {
            allowed_cpu_percentage: 0.10,
            cpu_slice: Duration::from_secs(3600),
            minimum_cycle_time: Duration::ZERO,
        };
        let mut crawler = Crawler::with_clock(sharedir.clone(), statefile, config, clock).unwrap();
        crawler.clock.advance(2.0); // pretend the slice itself took 2s

        let sleep = crawler.run_slice(&mut NoopHooks).unwrap();
        // work=2s, sleep = 2/0.10 - 2 = 18s; cycle finished instantly but
        // min_cycle_time is 0 here so it doesn't raise the sleep further.
        assert!((sleep.as_secs_f64() - 18.0).abs() < 0.001);

        let _ = fs::remove_dir_all(&sharedir);
    }

    #[test]
    fn finished_cycle_sleep_is_raised_to_minimum_cycle_time() {
        let sharedir = tmp_dir("min_cycle");
        let statefile = tmp_dir("min_cycle_state");
        let clock = FakeClock(Cell::new(0.0));
        let config = CrawlerConfig {
            allowed_cpu_percentage: 0.10,
            cpu_slice: Duration::from_secs(3600),
            minimum_cycle_time: Duration::from_secs(300),
        };
        let mut crawler = Crawler::with_clock(sharedir.clone(), statefile, config, clock).unwrap();

        let sleep = crawler.run_slice(&mut NoopHooks).unwrap();
        assert_eq!(sleep, Duration::from_secs(300));

        let _ = fs::remove_dir_all(&sharedir);
    }

    #[test]
    fn statefile_roundtrips_across_crawler_instances() {
        let sharedir = tmp_dir("persist");
        let statefile = tmp_dir("persist_state");
        let ps = prefixes();
        make_bucket(&sharedir, &ps[0], "only-bucket");

        let clock = FakeClock(Cell::new(0.0));
        let config = CrawlerConfig {
            allowed_cpu_percentage: 0.10,
            cpu_slice: Duration::from_secs(3600),
            minimum_cycle_time: Duration::ZERO,
        };
        let mut crawler =
            Crawler::with_clock(sharedir.clone(), statefile.clone(), config, clock).unwrap();
        let mut hooks = RecordingHooks::default();
        crawler.run_slice(&mut hooks).unwrap();
        drop(crawler);

        let raw = fs::read_to_string(&statefile).unwrap();
        let parsed: CrawlerState = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.last_cycle_finished, Some(0));
        assert!(!statefile.with_extension("tmp").exists());

        let _ = fs::remove_dir_all(&sharedir);
        let _ = fs::remove_file(&statefile);
    }
}
