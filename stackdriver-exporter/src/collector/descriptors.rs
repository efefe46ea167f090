use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::{Clock, Instant};

use crate::client::monitoring::MetricDescriptor;

struct Entry {
    descriptors: Vec<MetricDescriptor>,
    expires_at: Instant,
}

/// Cache of the metric descriptors listed for each prefix.
///
/// Descriptors rarely change, so listing them on every scrape mostly burns API quota.  With
/// `only_google` set, only prefixes of first-party metrics (whose domain ends in
/// `googleapis.com`) are cached, as custom metrics are more likely to appear at any time.
pub struct DescriptorCache {
    ttl: Duration,
    only_google: bool,
    clock: Clock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl DescriptorCache {
    /// Creates a new [`DescriptorCache`].  A zero `ttl` disables caching.
    pub fn new(ttl: Duration, only_google: bool) -> Self {
        Self::with_clock(Clock::new(), ttl, only_google)
    }

    /// Creates a new [`DescriptorCache`] using `clock` to expire entries.
    pub fn with_clock(clock: Clock, ttl: Duration, only_google: bool) -> Self {
        Self { ttl, only_google, clock, entries: Mutex::new(HashMap::new()) }
    }

    /// Gets the cached descriptors of a prefix, if still fresh.
    pub fn lookup(&self, prefix: &str) -> Option<Vec<MetricDescriptor>> {
        if !self.is_cacheable(prefix) {
            return None;
        }

        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(prefix) {
            Some(entry) if now < entry.expires_at => Some(entry.descriptors.clone()),
            Some(_) => {
                entries.remove(prefix);
                None
            }
            None => None,
        }
    }

    /// Caches the descriptors of a prefix.
    pub fn store(&self, prefix: &str, descriptors: &[MetricDescriptor]) {
        if !self.is_cacheable(prefix) {
            return;
        }

        let entry = Entry { descriptors: descriptors.to_vec(), expires_at: self.clock.now() + self.ttl };
        self.entries.lock().insert(prefix.to_string(), entry);
    }

    fn is_cacheable(&self, prefix: &str) -> bool {
        !self.ttl.is_zero() && (!self.only_google || is_google_metric(prefix))
    }
}

fn is_google_metric(prefix: &str) -> bool {
    prefix.split('/').next().is_some_and(|domain| domain.ends_with("googleapis.com"))
}
