use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use quanta::{Clock, Instant};
use tracing::debug;

use crate::fingerprint::Fingerprint;

/// A sample that can be accumulated by a [`DeltaStore`].
pub trait DeltaSample: Clone + Send {
    /// Gets the fingerprint of the series this sample belongs to.
    fn fingerprint(&self) -> Fingerprint;

    /// Gets the time at which the source reported this sample, in milliseconds since the Unix
    /// epoch.
    fn report_time_ms(&self) -> i64;

    /// Folds a previously accumulated sample of the same series into this one.
    fn accumulate(&mut self, previous: &Self);
}

/// Outcome of [`DeltaStore::accumulate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Accumulation {
    /// The series was not tracked (or had expired), and is now tracked from this sample.
    Tracked,
    /// The sample was newer than the tracked one, and was added to it.
    Incremented,
    /// The sample was not newer than the tracked one, and was dropped.
    Ignored,
}

struct Tracked<S> {
    sample: S,
    last_collected: Instant,
}

type Shard<S> = Arc<Mutex<HashMap<Fingerprint, Tracked<S>>>>;

/// Time-bounded accumulator for delta samples.
///
/// Delta metrics report the change over a sampling window, and so reset at the source on every
/// window.  To expose them as monotonic counters, each newer sample of a series is added to the
/// value accumulated so far.  Series that have not been updated for longer than the time-to-live
/// are evicted, and a later sample for them starts over as if seen for the first time.
///
/// Entries are sharded by metric descriptor: accumulating and listing series of one descriptor
/// never contends with another descriptor, and eviction of a series happens under the same lock
/// as its accumulation.  Eviction is driven by [`list`](DeltaStore::list) and
/// [`sweep`](DeltaStore::sweep); no background work happens inside the store.
pub struct DeltaStore<S> {
    clock: Clock,
    ttl: Duration,
    shards: RwLock<HashMap<String, Shard<S>>>,
}

impl<S: DeltaSample> DeltaStore<S> {
    /// Creates a new [`DeltaStore`] with the given time-to-live.
    pub fn new(ttl: Duration) -> DeltaStore<S> {
        Self::with_clock(Clock::new(), ttl)
    }

    /// Creates a new [`DeltaStore`] with the given time-to-live, using `clock` to track updates.
    pub fn with_clock(clock: Clock, ttl: Duration) -> DeltaStore<S> {
        DeltaStore { clock, ttl, shards: RwLock::new(HashMap::new()) }
    }

    /// Gets the time-to-live of tracked series.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Accumulates a sample for the given metric descriptor.
    ///
    /// A sample whose report time is not strictly newer than the tracked sample of its series is
    /// ignored, so observing the same point on consecutive scrapes never double counts it.
    pub fn accumulate(&self, descriptor: &str, mut sample: S) -> Accumulation {
        let shard = self.shard(descriptor);
        let fingerprint = sample.fingerprint();
        let now = self.clock.now();

        let mut entries = shard.lock();
        match entries.get_mut(&fingerprint) {
            Some(existing) if !self.is_expired(existing, now) => {
                if existing.sample.report_time_ms() < sample.report_time_ms() {
                    debug!(descriptor, fingerprint = fingerprint.as_u64(), "incrementing tracked delta series");
                    sample.accumulate(&existing.sample);
                    existing.sample = sample;
                    existing.last_collected = now;
                    Accumulation::Incremented
                } else {
                    debug!(descriptor, fingerprint = fingerprint.as_u64(), "ignoring stale delta sample");
                    Accumulation::Ignored
                }
            }
            _ => {
                debug!(descriptor, fingerprint = fingerprint.as_u64(), "tracking new delta series");
                entries.insert(fingerprint, Tracked { sample, last_collected: now });
                Accumulation::Tracked
            }
        }
    }

    /// Lists the accumulated samples of the given metric descriptor.
    ///
    /// Expired series are evicted before listing.
    pub fn list(&self, descriptor: &str) -> Vec<S> {
        let shard = match self.shards.read().get(descriptor) {
            Some(shard) => Arc::clone(shard),
            None => return Vec::new(),
        };

        let now = self.clock.now();
        let mut entries = shard.lock();
        entries.retain(|_, tracked| !self.is_expired(tracked, now));
        entries.values().map(|tracked| tracked.sample.clone()).collect()
    }

    /// Evicts every expired series, returning how many were evicted.
    ///
    /// Descriptors left without any series are dropped as well.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        let mut shards = self.shards.write();
        shards.retain(|descriptor, shard| {
            let mut entries = shard.lock();
            let before = entries.len();
            entries.retain(|_, tracked| !self.is_expired(tracked, now));
            evicted += before - entries.len();

            // Only drop a shard nobody else holds, or a concurrent accumulate would be lost.
            let keep = !entries.is_empty() || Arc::strong_count(shard) > 1;
            if !keep {
                debug!(descriptor = descriptor.as_str(), "dropping empty delta descriptor");
            }
            keep
        });

        evicted
    }

    /// Gets the number of tracked series, expired or not.
    pub fn len(&self) -> usize {
        self.shards.read().values().map(|shard| shard.lock().len()).sum()
    }

    /// Returns `true` if no series are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, descriptor: &str) -> Shard<S> {
        if let Some(shard) = self.shards.read().get(descriptor) {
            return Arc::clone(shard);
        }

        let mut shards = self.shards.write();
        Arc::clone(shards.entry(descriptor.to_string()).or_default())
    }

    fn is_expired(&self, tracked: &Tracked<S>, now: Instant) -> bool {
        now.saturating_duration_since(tracked.last_collected) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use quanta::Clock;

    use super::{Accumulation, DeltaSample, DeltaStore};
    use crate::fingerprint::Fingerprint;

    #[derive(Clone, Debug, PartialEq)]
    struct Sample {
        series: &'static str,
        value: f64,
        reported_at: i64,
    }

    impl DeltaSample for Sample {
        fn fingerprint(&self) -> Fingerprint {
            Fingerprint::new("project", "descriptor", [("series", self.series)])
        }

        fn report_time_ms(&self) -> i64 {
            self.reported_at
        }

        fn accumulate(&mut self, previous: &Self) {
            self.value += previous.value;
        }
    }

    fn sample(series: &'static str, value: f64, reported_at: i64) -> Sample {
        Sample { series, value, reported_at }
    }

    #[test]
    fn test_newer_samples_accumulate() {
        let store = DeltaStore::new(Duration::from_secs(60));

        assert_eq!(store.accumulate("d", sample("a", 3.0, 1_000)), Accumulation::Tracked);
        assert_eq!(store.accumulate("d", sample("a", 2.0, 2_000)), Accumulation::Incremented);

        assert_eq!(store.list("d"), vec![sample("a", 5.0, 2_000)]);
    }

    #[test]
    fn test_same_point_is_not_counted_twice() {
        let store = DeltaStore::new(Duration::from_secs(60));

        store.accumulate("d", sample("a", 3.0, 1_000));
        assert_eq!(store.accumulate("d", sample("a", 3.0, 1_000)), Accumulation::Ignored);
        assert_eq!(store.accumulate("d", sample("a", 9.0, 500)), Accumulation::Ignored);

        assert_eq!(store.list("d"), vec![sample("a", 3.0, 1_000)]);
    }

    #[test]
    fn test_values_never_decrease_within_ttl() {
        let store = DeltaStore::new(Duration::from_secs(60));

        let mut last = 0.0;
        for (i, delta) in [4.0, 0.0, 1.5, 7.0, 0.25].into_iter().enumerate() {
            store.accumulate("d", sample("a", delta, i as i64 * 60_000));
            let current = store.list("d")[0].value;
            assert!(current >= last, "value decreased from {last} to {current}");
            last = current;
        }
        assert_eq!(last, 12.75);
    }

    #[test]
    fn test_expired_series_are_evicted_and_start_over() {
        let (clock, mock) = Clock::mock();
        let store = DeltaStore::with_clock(clock, Duration::from_secs(10));

        store.accumulate("d", sample("a", 3.0, 1_000));
        mock.increment(Duration::from_secs(9));
        assert_eq!(store.list("d").len(), 1);

        mock.increment(Duration::from_secs(2));
        assert!(store.list("d").is_empty());

        assert_eq!(store.accumulate("d", sample("a", 1.0, 500)), Accumulation::Tracked);
        assert_eq!(store.list("d"), vec![sample("a", 1.0, 500)]);
    }

    #[test]
    fn test_updates_refresh_the_ttl() {
        let (clock, mock) = Clock::mock();
        let store = DeltaStore::with_clock(clock, Duration::from_secs(10));

        store.accumulate("d", sample("a", 1.0, 1_000));
        mock.increment(Duration::from_secs(8));
        store.accumulate("d", sample("a", 1.0, 2_000));
        mock.increment(Duration::from_secs(8));

        assert_eq!(store.list("d"), vec![sample("a", 2.0, 2_000)]);
    }

    #[test]
    fn test_sweep_evicts_across_descriptors() {
        let (clock, mock) = Clock::mock();
        let store = DeltaStore::with_clock(clock, Duration::from_secs(10));

        store.accumulate("d1", sample("a", 1.0, 1_000));
        store.accumulate("d2", sample("b", 1.0, 1_000));
        mock.increment(Duration::from_secs(5));
        store.accumulate("d2", sample("c", 1.0, 1_000));
        assert_eq!(store.len(), 3);

        mock.increment(Duration::from_secs(6));
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.list("d1").is_empty());
        assert_eq!(store.list("d2").len(), 1);
    }

    #[test]
    fn test_concurrent_accumulation_is_consistent() {
        let store = Arc::new(DeltaStore::new(Duration::from_secs(60)));

        let handles = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100 {
                        let series = if worker % 2 == 0 { "even" } else { "odd" };
                        store.accumulate("shared", sample(series, 1.0, worker * 1_000 + i));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut listed = store.list("shared");
        listed.sort_by(|a, b| a.series.cmp(b.series));
        assert_eq!(listed.len(), 2);
        for tracked in listed {
            // Every accepted sample is strictly newer than the previous one, so the value is at
            // least one and never more than the number of samples sent for the series.
            assert!(tracked.value >= 1.0 && tracked.value <= 200.0, "{tracked:?}");
        }
    }
}
