//! Short-lived memory of unregistered devices heard during scans.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use blebridge_types::Family;

/// Default time an unregistered device stays listed after it was last heard.
pub const DEFAULT_SCAN_CACHE_TTL: Duration = Duration::from_secs(30);

/// A device heard recently but not (yet) registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCacheEntry {
    pub address: String,
    pub name: Option<String>,
    /// `None` until an advertisement classified it.
    pub family: Option<Family>,
    pub rssi: Option<i16>,
    pub last_seen: Instant,
}

/// Devices heard recently, keyed by address.
#[derive(Debug)]
pub struct ScanCache {
    entries: HashMap<String, ScanCacheEntry>,
    ttl: Duration,
}

impl Default for ScanCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_CACHE_TTL)
    }
}

impl ScanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record a sighting. Fields the advertisement did not carry keep their
    /// previous values; `last_seen` is always reset.
    pub fn observe(
        &mut self,
        address: &str,
        name: Option<&str>,
        family: Family,
        rssi: Option<i16>,
        now: Instant,
    ) {
        let entry = self
            .entries
            .entry(address.to_string())
            .or_insert_with(|| ScanCacheEntry {
                address: address.to_string(),
                name: None,
                family: None,
                rssi: None,
                last_seen: now,
            });
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }
        if family != Family::Unknown {
            entry.family = Some(family);
        }
        if rssi.is_some() {
            entry.rssi = rssi;
        }
        entry.last_seen = now;
    }

    /// Drop entries unseen for longer than the TTL; returns their addresses.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let mut evicted = Vec::new();
        self.entries.retain(|address, entry| {
            let keep = now.saturating_duration_since(entry.last_seen) <= ttl;
            if !keep {
                evicted.push(address.clone());
            }
            keep
        });
        evicted
    }

    /// Take an entry out of the cache, e.g. to promote it into the registry.
    pub fn remove(&mut self, address: &str) -> Option<ScanCacheEntry> {
        self.entries.remove(address)
    }

    pub fn get(&self, address: &str) -> Option<&ScanCacheEntry> {
        self.entries.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    /// Entries sorted by address.
    pub fn entries(&self) -> Vec<&ScanCacheEntry> {
        let mut list: Vec<_> = self.entries.values().collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        list
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_evicted_once_after_ttl() {
        let mut cache = ScanCache::default();
        cache.observe("AA", Some("Aranet4 1"), Family::Aranet4, Some(-70), Instant::now());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.evict_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.evict_expired(Instant::now()), vec!["AA".to_string()]);
        assert!(cache.evict_expired(Instant::now()).is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resighting_resets_age() {
        let mut cache = ScanCache::default();
        cache.observe("AA", None, Family::Unknown, None, Instant::now());

        tokio::time::advance(Duration::from_secs(25)).await;
        cache.observe("AA", None, Family::Unknown, Some(-60), Instant::now());

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(cache.evict_expired(Instant::now()).is_empty());
        assert_eq!(cache.get("AA").and_then(|e| e.rssi), Some(-60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_keeps_known_fields() {
        let mut cache = ScanCache::default();
        let now = Instant::now();
        cache.observe("AA", Some("Ruuvi 12AB"), Family::BeaconTag, Some(-80), now);
        cache.observe("AA", None, Family::Unknown, None, now);

        let entry = cache.get("AA").unwrap();
        assert_eq!(entry.name.as_deref(), Some("Ruuvi 12AB"));
        assert_eq!(entry.family, Some(Family::BeaconTag));
        assert_eq!(entry.rssi, Some(-80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_promotes_entry() {
        let mut cache = ScanCache::default();
        cache.observe("BB", None, Family::Aranet2, None, Instant::now());
        cache.observe("AA", None, Family::Unknown, None, Instant::now());

        assert_eq!(
            cache.entries().iter().map(|e| e.address.as_str()).collect::<Vec<_>>(),
            ["AA", "BB"]
        );
        assert_eq!(cache.remove("BB").map(|e| e.family), Some(Some(Family::Aranet2)));
        assert!(!cache.contains("BB"));
        assert_eq!(cache.len(), 1);
    }
}
