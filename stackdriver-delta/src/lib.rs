//! Accumulation of delta samples into stable counters.
//!
//! Sources such as Cloud Monitoring report DELTA metrics as the change observed over a sampling
//! window.  [`DeltaStore`] keeps a running total per series, keyed by [`Fingerprint`], so that the
//! values can be exposed as monotonic counters and histograms.  Series that stop reporting are
//! evicted once their time-to-live elapses.
#![deny(missing_docs)]

mod fingerprint;
pub use self::fingerprint::Fingerprint;

mod store;
pub use self::store::{Accumulation, DeltaSample, DeltaStore};
