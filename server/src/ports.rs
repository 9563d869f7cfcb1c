//! Public port allocator for TCP/TLS/UDP tunnels.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tunlink_shared::{Error, Result};

/// Freed slots are held back briefly so a reconnecting peer cannot land on
/// a port still draining in TIME_WAIT.
const RELEASE_GRACE: Duration = Duration::from_secs(2);

struct Inner {
    /// One bit per port in the range; set = allocated.
    bits: Vec<u64>,
    /// Scan cursor, index of the last allocation.
    last: usize,
    /// Recently released slots and when they were freed.
    cooling: HashMap<u16, Instant>,
}

/// Bit-set allocator over a reserved contiguous range.
pub struct PortAllocator {
    start: u16,
    len: usize,
    grace: Duration,
    inner: Mutex<Inner>,
}

impl PortAllocator {
    pub fn new(range: (u16, u16)) -> Self {
        Self::with_grace(range, RELEASE_GRACE)
    }

    pub fn with_grace(range: (u16, u16), grace: Duration) -> Self {
        let (start, end) = range;
        let len = (end - start) as usize + 1;
        Self {
            start,
            len,
            grace,
            inner: Mutex::new(Inner {
                bits: vec![0u64; len.div_ceil(64)],
                last: len - 1,
                cooling: HashMap::new(),
            }),
        }
    }

    /// Next free port, scanning linearly from the slot after the last
    /// allocation.
    pub fn allocate(&self) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap();
        let len = self.len;
        for offset in 1..=len {
            let idx = (inner.last + offset) % len;
            if inner.bits[idx / 64] & (1 << (idx % 64)) != 0 {
                continue;
            }
            let port = self.start + idx as u16;
            if let Some(freed) = inner.cooling.get(&port) {
                if freed.elapsed() < self.grace {
                    continue;
                }
                inner.cooling.remove(&port);
            }
            inner.bits[idx / 64] |= 1 << (idx % 64);
            inner.last = idx;
            return Ok(port);
        }
        Err(Error::PortExhausted)
    }

    /// Take a specific port, for reattach.
    pub fn claim(&self, port: u16) -> bool {
        if port < self.start || (port - self.start) as usize >= self.len {
            return false;
        }
        let idx = (port - self.start) as usize;
        let mut inner = self.inner.lock().unwrap();
        if inner.bits[idx / 64] & (1 << (idx % 64)) != 0 {
            return false;
        }
        inner.bits[idx / 64] |= 1 << (idx % 64);
        inner.cooling.remove(&port);
        true
    }

    /// Free a slot, subject to the reuse grace.
    pub fn release(&self, port: u16) {
        if port < self.start || (port - self.start) as usize >= self.len {
            return;
        }
        let idx = (port - self.start) as usize;
        let mut inner = self.inner.lock().unwrap();
        inner.bits[idx / 64] &= !(1 << (idx % 64));
        inner.cooling.insert(port, Instant::now());
    }

    pub fn allocated(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_scan_from_range_start() {
        let ports = PortAllocator::new((20000, 20004));
        assert_eq!(ports.allocate().unwrap(), 20000);
        assert_eq!(ports.allocate().unwrap(), 20001);
        assert_eq!(ports.allocate().unwrap(), 20002);
    }

    #[test]
    fn test_exhaustion() {
        let ports = PortAllocator::new((20000, 20001));
        ports.allocate().unwrap();
        ports.allocate().unwrap();
        assert!(matches!(ports.allocate(), Err(Error::PortExhausted)));
    }

    #[test]
    fn test_release_grace_blocks_immediate_reuse() {
        let ports = PortAllocator::new((20000, 20000));
        assert_eq!(ports.allocate().unwrap(), 20000);
        ports.release(20000);
        // Only slot in range is cooling: allocation must fail.
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn test_release_with_zero_grace_reuses() {
        let ports = PortAllocator::with_grace((20000, 20000), Duration::from_secs(0));
        assert_eq!(ports.allocate().unwrap(), 20000);
        ports.release(20000);
        assert_eq!(ports.allocate().unwrap(), 20000);
    }

    #[test]
    fn test_claim_specific_port() {
        let ports = PortAllocator::new((20000, 20010));
        assert!(ports.claim(20005));
        assert!(!ports.claim(20005));
        assert!(!ports.claim(19999));
        // The scan skips the claimed slot.
        for _ in 0..10 {
            assert_ne!(ports.allocate().unwrap(), 20005);
        }
    }

    #[test]
    fn test_scan_resumes_after_cursor() {
        let ports = PortAllocator::new((20000, 20002));
        assert_eq!(ports.allocate().unwrap(), 20000);
        ports.release(20000);
        // Cursor sits at 20000; next scan starts at 20001 even though
        // 20000 would clear its grace later.
        assert_eq!(ports.allocate().unwrap(), 20001);
    }
}
