/*!
 * Cached device properties.
 *
 * The cache is written only by the status sync engine, one whole pass at a
 * time, and read by everyone else through snapshots. A property is valid
 * only while its validity flag is set and its timestamp is younger than the
 * staleness threshold.
 */
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use starflow_core::types::Value;

/// One cached property
#[derive(Debug, Clone)]
pub struct CachedProperty {
    /// Last fetched value
    pub value: Value,
    /// Monotonic time of the fetch
    pub updated_at: Instant,
    /// Wall-clock time of the fetch
    pub wall_time: DateTime<Utc>,
    valid: bool,
}

impl CachedProperty {
    /// Valid flag set and not older than `stale_after`
    pub fn is_valid(&self, now: Instant, stale_after: Duration) -> bool {
        self.valid && now.saturating_duration_since(self.updated_at) <= stale_after
    }
}

/// A property as seen by a reader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyReading {
    /// Property name
    pub name: String,
    /// Last fetched value
    pub value: Value,
    /// Age of the value
    pub age: Duration,
    /// When it was fetched
    pub updated_at: DateTime<Utc>,
    /// False when the value is stale
    pub valid: bool,
}

/// Ordered property name to value mapping with freshness tracking
#[derive(Debug, Clone)]
pub struct CachedPropertySet {
    stale_after: Duration,
    entries: Vec<(String, CachedProperty)>,
    index: HashMap<String, usize>,
}

impl CachedPropertySet {
    /// Create an empty set
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Staleness threshold
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Store the results of one completed fetch
    ///
    /// Names are lowercased. New names are appended in arrival order.
    pub fn apply<I>(&mut self, values: I, now: Instant, wall_time: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut count = 0;
        for (name, value) in values {
            let name = name.to_ascii_lowercase();
            let property = CachedProperty {
                value,
                updated_at: now,
                wall_time,
                valid: true,
            };
            match self.index.get(&name) {
                Some(&slot) => self.entries[slot].1 = property,
                None => {
                    self.index.insert(name.clone(), self.entries.len());
                    self.entries.push((name, property));
                }
            }
            count += 1;
        }
        count
    }

    /// Keep values but stop reporting them as valid
    pub fn mark_all_stale(&mut self) {
        for (_, property) in &mut self.entries {
            property.valid = false;
        }
    }

    /// Look up a property regardless of freshness
    pub fn get(&self, name: &str) -> Option<&CachedProperty> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&slot| &self.entries[slot].1)
    }

    /// The value only if it is currently valid
    pub fn valid_value(&self, name: &str, now: Instant) -> Option<&Value> {
        self.get(name)
            .filter(|p| p.is_valid(now, self.stale_after))
            .map(|p| &p.value)
    }

    /// Whether `name` is present and valid
    pub fn is_valid(&self, name: &str, now: Instant) -> bool {
        self.valid_value(name, now).is_some()
    }

    /// Property names in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Number of cached properties
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been cached yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy out every property with its freshness evaluated at `now`
    pub fn snapshot(&self, now: Instant) -> Vec<PropertyReading> {
        self.entries
            .iter()
            .map(|(name, property)| PropertyReading {
                name: name.clone(),
                value: property.value.clone(),
                age: now.saturating_duration_since(property.updated_at),
                updated_at: property.wall_time,
                valid: property.is_valid(now, self.stale_after),
            })
            .collect()
    }
}

/// A cloneable handle to a property set shared between writer and readers
///
/// The lock is held only for a copy or a whole-pass write.
#[derive(Debug, Clone)]
pub struct SharedPropertyCache(Arc<RwLock<CachedPropertySet>>);

impl SharedPropertyCache {
    /// Create an empty shared cache
    pub fn new(stale_after: Duration) -> Self {
        Self(Arc::new(RwLock::new(CachedPropertySet::new(stale_after))))
    }

    /// Run `f` against the set under the read lock
    pub fn read<T>(&self, f: impl FnOnce(&CachedPropertySet) -> T) -> T {
        let guard = self.0.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Run `f` against the set under the write lock
    pub fn write<T>(&self, f: impl FnOnce(&mut CachedPropertySet) -> T) -> T {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Snapshot of every property at the current time
    pub fn snapshot(&self) -> Vec<PropertyReading> {
        self.read(|set| set.snapshot(Instant::now()))
    }

    /// Current value of `name` if it is valid
    pub fn valid_value(&self, name: &str) -> Option<Value> {
        self.read(|set| set.valid_value(name, Instant::now()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_apply_preserves_insertion_order_and_lowercases() {
        let mut set = CachedPropertySet::new(Duration::from_secs(10));
        let now = Instant::now();
        set.apply(values(&[("Position", 10.into()), ("IsMoving", false.into())]), now, Utc::now());
        set.apply(values(&[("position", 12.into())]), now, Utc::now());

        assert_eq!(set.names().collect::<Vec<_>>(), vec!["position", "ismoving"]);
        assert_eq!(set.get("POSITION").map(|p| p.value.clone()), Some(Value::Integer(12)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_mark_all_stale_keeps_values() {
        let mut set = CachedPropertySet::new(Duration::from_secs(10));
        let now = Instant::now();
        set.apply(values(&[("azimuth", 180.5.into())]), now, Utc::now());
        assert!(set.is_valid("azimuth", now));

        set.mark_all_stale();
        assert!(!set.is_valid("azimuth", now));
        assert_eq!(set.get("azimuth").map(|p| p.value.clone()), Some(Value::Float(180.5)));

        let snapshot = set.snapshot(now);
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].valid);
    }

    #[test]
    fn test_property_expires_after_threshold() {
        let mut set = CachedPropertySet::new(Duration::from_secs(10));
        let t0 = Instant::now();
        set.apply(values(&[("slewing", false.into())]), t0, Utc::now());

        assert!(set.is_valid("slewing", t0 + Duration::from_secs(10)));
        assert!(!set.is_valid("slewing", t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_refetch_restores_validity() {
        let mut set = CachedPropertySet::new(Duration::from_secs(10));
        let t0 = Instant::now();
        set.apply(values(&[("slewing", false.into())]), t0, Utc::now());
        set.mark_all_stale();
        set.apply(values(&[("slewing", true.into())]), t0, Utc::now());
        assert_eq!(set.valid_value("slewing", t0), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_shared_cache_readers_see_whole_writes() {
        let cache = SharedPropertyCache::new(Duration::from_secs(10));
        let reader = cache.clone();
        cache.write(|set| {
            set.apply(values(&[("a", 1.into()), ("b", 2.into())]), Instant::now(), Utc::now())
        });
        assert_eq!(reader.snapshot().len(), 2);
        assert_eq!(reader.valid_value("b"), Some(Value::Integer(2)));
    }
}
