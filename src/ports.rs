//! Local port allocation for preview instances
//!
//! Ports are handed out from a fixed inclusive range. A port is eligible when
//! nothing in this process holds it and a bind probe on the listen host
//! succeeds. Probing happens outside the pool lock; a port being probed is
//! marked so that concurrent reservations never probe the same port twice.

use crate::error::PreviewError;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use tracing::{debug, trace};

#[derive(Debug)]
struct PortPool {
    in_use: BTreeSet<u16>,
    probing: BTreeSet<u16>,
    cursor: u16,
}

/// Tracks which ports of the range belong to live instances
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    listen_host: String,
    pool: Mutex<PortPool>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, listen_host: &str) -> Self {
        Self {
            pool: Mutex::new(PortPool {
                in_use: BTreeSet::new(),
                probing: BTreeSet::new(),
                cursor: *range.start(),
            }),
            range,
            listen_host: listen_host.to_string(),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    fn exhausted(&self) -> PreviewError {
        PreviewError::NoPortsAvailable {
            start: *self.range.start(),
            end: *self.range.end(),
        }
    }

    /// Pick the next port after the cursor that is neither in use, being
    /// probed, nor in `skipped`, and mark it as being probed
    pub fn next_candidate(&self, skipped: &BTreeSet<u16>) -> Result<u16, PreviewError> {
        let mut pool = self.pool.lock();
        let start = *self.range.start();
        let end = *self.range.end();
        let size = usize::from(end - start) + 1;

        let mut port = pool.cursor.clamp(start, end);
        for _ in 0..size {
            if !pool.in_use.contains(&port)
                && !pool.probing.contains(&port)
                && !skipped.contains(&port)
            {
                pool.probing.insert(port);
                pool.cursor = if port == end { start } else { port + 1 };
                return Ok(port);
            }
            port = if port == end { start } else { port + 1 };
        }

        Err(self.exhausted())
    }

    /// Try binding the port on the listen host
    pub fn probe(&self, port: u16) -> bool {
        match TcpListener::bind((self.listen_host.as_str(), port)) {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                trace!(port, "Port held by another process");
                false
            }
            Err(e) => {
                debug!(port, error = %e, "Port bind probe failed");
                false
            }
        }
    }

    /// Move a probed candidate into the pool
    ///
    /// Returns false when the port is already in use.
    pub fn claim(&self, port: u16) -> bool {
        let mut pool = self.pool.lock();
        pool.probing.remove(&port);
        pool.in_use.insert(port)
    }

    /// Drop a candidate that will not be claimed
    pub fn discard(&self, port: u16) {
        self.pool.lock().probing.remove(&port);
    }

    /// Reserve a free port
    pub fn reserve(&self) -> Result<u16, PreviewError> {
        let mut skipped = BTreeSet::new();
        loop {
            let port = self.next_candidate(&skipped)?;
            if !self.probe(port) {
                self.discard(port);
                skipped.insert(port);
                continue;
            }
            if self.claim(port) {
                debug!(port, "Reserved port");
                return Ok(port);
            }
            skipped.insert(port);
        }
    }

    /// Return a port to the range. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        if self.pool.lock().in_use.remove(&port) {
            debug!(port, "Released port");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.pool.lock().in_use.contains(&port)
    }

    /// Ports currently owned by instances, ascending
    pub fn in_use(&self) -> Vec<u16> {
        self.pool.lock().in_use.iter().copied().collect()
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> usize {
        usize::from(*self.range.end() - *self.range.start()) + 1
    }

    /// Ports not tracked as in use (they may still fail a bind probe)
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.pool.lock().in_use.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Each test searches from its own base so parallel tests never share ports
    fn free_range(base: u16, len: u16) -> RangeInclusive<u16> {
        let mut start = base;
        'outer: loop {
            for port in start..start + len {
                if TcpListener::bind(("127.0.0.1", port)).is_err() {
                    start = port + 1;
                    continue 'outer;
                }
            }
            return start..=start + len - 1;
        }
    }

    #[test]
    fn test_reserve_and_release() {
        let allocator = PortAllocator::new(free_range(42000, 3), "127.0.0.1");

        let port = allocator.reserve().unwrap();
        assert!(allocator.range().contains(&port));
        assert!(allocator.is_reserved(port));
        assert_eq!(allocator.available(), 2);

        allocator.release(port);
        assert!(!allocator.is_reserved(port));
        assert_eq!(allocator.available(), 3);
        assert!(allocator.in_use().is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(free_range(42100, 2), "127.0.0.1");
        let port = allocator.reserve().unwrap();

        allocator.release(port);
        allocator.release(port);
        allocator.release(1);
        assert_eq!(allocator.available(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let range = free_range(42200, 2);
        let allocator = PortAllocator::new(range.clone(), "127.0.0.1");

        let a = allocator.reserve().unwrap();
        let b = allocator.reserve().unwrap();
        assert_ne!(a, b);

        match allocator.reserve() {
            Err(PreviewError::NoPortsAvailable { start, end }) => {
                assert_eq!(start, *range.start());
                assert_eq!(end, *range.end());
            }
            other => panic!("expected NoPortsAvailable, got {:?}", other),
        }
    }

    #[test]
    fn test_skips_ports_held_elsewhere() {
        let range = free_range(42300, 2);
        let _held = TcpListener::bind(("127.0.0.1", *range.start())).unwrap();
        let allocator = PortAllocator::new(range.clone(), "127.0.0.1");

        assert_eq!(allocator.reserve().unwrap(), *range.end());
        assert!(allocator.reserve().is_err());
        // The held port was never tracked
        assert!(!allocator.is_reserved(*range.start()));
    }

    #[test]
    fn test_cursor_rotates() {
        let allocator = PortAllocator::new(free_range(42400, 3), "127.0.0.1");

        let first = allocator.reserve().unwrap();
        allocator.release(first);
        let second = allocator.reserve().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_concurrent_reserve_never_duplicates() {
        let range = free_range(42500, 8);
        let allocator = Arc::new(PortAllocator::new(range, "127.0.0.1"));

        let handles: Vec<_> = (0..9)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.reserve())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut ports: Vec<u16> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        let failures = results.iter().filter(|r| r.is_err()).count();

        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 8);
        assert_eq!(failures, 1);
    }
}
