//! Sliding-window rate limiting.
//!
//! A [`Throttle`] gates one direction of traffic for one torrent: every sent
//! or received payload is recorded as a timestamped entry, and the gate is
//! closed while the sum of entries inside the window has reached the byte
//! budget. Entries optionally carry the peer they were charged for, which is
//! what the per-peer speed counters are computed from.
//!
//! One instance is shared by everything moving bytes in that direction, so
//! all operations take the same internal lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    at: Instant,
    size: u64,
    peer: Option<SocketAddr>,
}

/// A shared sliding-window byte-budget gate.
pub struct Throttle {
    max_bytes: AtomicU64,
    window: Duration,
    entries: Mutex<Vec<Entry>>,
}

impl Throttle {
    pub fn new(max_bytes: u64, window: Duration) -> Self {
        Self {
            max_bytes: AtomicU64::new(max_bytes),
            window,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Records `size` bytes transferred now, optionally charged to a peer.
    pub fn add(&self, size: u64, peer: Option<SocketAddr>) {
        self.entries.lock().push(Entry {
            at: Instant::now(),
            size,
            peer,
        });
    }

    /// Whether the window budget is exhausted.
    pub fn is_throttled(&self) -> bool {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, self.window);
        let sum: u64 = entries.iter().map(|e| e.size).sum();
        sum >= self.max_bytes.load(Ordering::Relaxed)
    }

    /// Bytes recorded inside the current window.
    ///
    /// With the default one-second window this doubles as a bytes-per-second
    /// rate counter.
    pub fn value(&self) -> u64 {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, self.window);
        entries.iter().map(|e| e.size).sum()
    }

    /// Bytes inside the window charged to one peer.
    pub fn rate_for(&self, peer: SocketAddr) -> u64 {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, self.window);
        entries
            .iter()
            .filter(|e| e.peer == Some(peer))
            .map(|e| e.size)
            .sum()
    }

    /// Adjusts the byte budget at runtime.
    pub fn set_limit(&self, max_bytes: u64) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    fn prune(entries: &mut Vec<Entry>, window: Duration) {
        let now = Instant::now();
        entries.retain(|e| now.duration_since(e.at) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_throttled_at_budget() {
        let throttle = Throttle::new(100, Duration::from_secs(10));
        assert!(!throttle.is_throttled());

        throttle.add(60, None);
        assert!(!throttle.is_throttled());
        assert_eq!(throttle.value(), 60);

        throttle.add(40, None);
        assert!(throttle.is_throttled());
        assert_eq!(throttle.value(), 100);
    }

    #[test]
    fn test_window_expiry() {
        let throttle = Throttle::new(100, Duration::from_millis(30));
        throttle.add(200, None);
        assert!(throttle.is_throttled());

        std::thread::sleep(Duration::from_millis(60));
        assert!(!throttle.is_throttled());
        assert_eq!(throttle.value(), 0);
    }

    #[test]
    fn test_per_peer_rate() {
        let throttle = Throttle::new(1000, Duration::from_secs(10));
        throttle.add(10, Some(addr(1)));
        throttle.add(20, Some(addr(2)));
        throttle.add(30, Some(addr(1)));
        throttle.add(5, None);

        assert_eq!(throttle.rate_for(addr(1)), 40);
        assert_eq!(throttle.rate_for(addr(2)), 20);
        assert_eq!(throttle.value(), 65);
    }

    #[test]
    fn test_runtime_limit_change() {
        let throttle = Throttle::new(100, Duration::from_secs(10));
        throttle.add(100, None);
        assert!(throttle.is_throttled());

        throttle.set_limit(200);
        assert!(!throttle.is_throttled());
    }
}
