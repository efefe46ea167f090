use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Identity of one accumulated series.
///
/// A fingerprint is derived from the project, the metric descriptor and the full label set of a
/// series.  Label order does not matter: two label sets with the same pairs produce the same
/// fingerprint.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Computes the fingerprint of a series.
    pub fn new<'a, I>(project: &str, descriptor: &str, labels: I) -> Fingerprint
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut labels = labels.into_iter().collect::<Vec<_>>();
        labels.sort_unstable();

        let mut hasher = DefaultHasher::new();
        project.hash(&mut hasher);
        descriptor.hash(&mut hasher);
        for (key, value) in labels {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }

        Fingerprint(hasher.finish())
    }

    /// Gets the raw hash value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}
