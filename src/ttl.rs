use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Append-and-scan collection whose entries self-expire.
///
/// The slice spawns nothing on its own: the owning dispatcher drives one
/// shared compaction tick over all live slices. Readers filter by expiry so
/// they tolerate the compaction lag.
pub struct TtlSlice<T> {
    items: Mutex<Vec<Entry<T>>>,
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> TtlSlice<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, value: T, ttl: Duration) {
        let mut items = self.items.lock().expect("ttl slice lock poisoned");
        items.push(Entry {
            value,
            expires_at: Instant::now() + ttl,
        });
    }

    /// Non-expired values in insertion order.
    pub fn list(&self) -> Vec<T> {
        let now = Instant::now();
        let items = self.items.lock().expect("ttl slice lock poisoned");
        items
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Drop expired entries.
    pub fn compact(&self) {
        let now = Instant::now();
        let mut items = self.items.lock().expect("ttl slice lock poisoned");
        items.retain(|entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn lists_entries_in_insertion_order() {
        let slice = TtlSlice::new();
        slice.append(1, Duration::from_secs(10));
        slice.append(2, Duration::from_secs(10));
        slice.append(3, Duration::from_secs(10));
        assert_eq!(slice.list(), vec![1, 2, 3]);
    }

    #[test]
    fn expired_entries_disappear_from_readers() {
        let slice = TtlSlice::new();
        for i in 0..10 {
            slice.append(i, Duration::from_millis(10));
        }
        slice.append(99, Duration::from_secs(10));
        sleep(Duration::from_millis(50));
        assert_eq!(slice.list(), vec![99]);
    }

    #[test]
    fn fully_expired_slice_is_empty() {
        let slice = TtlSlice::new();
        for i in 0..10 {
            slice.append(i, Duration::from_millis(10));
        }
        sleep(Duration::from_millis(50));
        assert!(slice.list().is_empty());
    }

    #[test]
    fn compact_drops_only_expired_entries() {
        let slice = TtlSlice::new();
        slice.append("short", Duration::from_millis(10));
        slice.append("long", Duration::from_secs(10));
        sleep(Duration::from_millis(50));
        slice.compact();
        assert_eq!(slice.list(), vec!["long"]);
    }
}
