//! Random subdomain pool with reattach cool-down.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::debug;

use tunlink_shared::{Error, Result};

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const DEFAULT_LEN: usize = 8;
const MAX_COLLISIONS: usize = 10;

/// How long a released subdomain stays reserved for reattach.
pub const COOLDOWN: Duration = Duration::from_secs(300);

/// Mints and recycles subdomains. Names released by a dropped link sit in
/// a cool-down set so only a reattaching owner can take them back.
pub struct SubdomainPool {
    live: DashSet<String>,
    cooling: Mutex<HashMap<String, Instant>>,
    cooldown: Duration,
}

impl SubdomainPool {
    pub fn new() -> Self {
        Self::with_cooldown(COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            live: DashSet::new(),
            cooling: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// Mint a fresh subdomain: up to ten 8-char draws, then one 9-char draw.
    pub fn allocate(&self) -> Result<String> {
        for attempt in 0..=MAX_COLLISIONS {
            let len = if attempt < MAX_COLLISIONS {
                DEFAULT_LEN
            } else {
                DEFAULT_LEN + 1
            };
            let candidate = gen_candidate(len);
            if self.try_take(&candidate) {
                if attempt > 0 {
                    debug!(subdomain = %candidate, attempt, "subdomain minted after collisions");
                }
                return Ok(candidate);
            }
        }
        Err(Error::SubdomainUnavailable)
    }

    /// Claim a caller-chosen subdomain, if valid and free.
    pub fn claim(&self, name: &str) -> Result<String> {
        let name = name.to_ascii_lowercase();
        if !valid_subdomain(&name) {
            return Err(Error::AdmissionRejected(format!(
                "invalid subdomain: {name}"
            )));
        }
        if self.try_take(&name) {
            Ok(name)
        } else {
            Err(Error::SubdomainUnavailable)
        }
    }

    /// Take back a cooling subdomain during reattach.
    pub fn reclaim(&self, name: &str) -> bool {
        let mut cooling = self.cooling.lock().unwrap();
        if cooling.remove(name).is_some() {
            drop(cooling);
            self.live.insert(name.to_string());
            true
        } else {
            // Never released (e.g. server kept it live) or already expired.
            drop(cooling);
            self.live.insert(name.to_string())
        }
    }

    /// Release a subdomain into cool-down.
    pub fn release(&self, name: &str) {
        if self.live.remove(name).is_some() {
            self.cooling
                .lock()
                .unwrap()
                .insert(name.to_string(), Instant::now());
        }
    }

    /// Drop cool-down entries past their window.
    pub fn sweep(&self) {
        let cooldown = self.cooldown;
        self.cooling
            .lock()
            .unwrap()
            .retain(|_, released| released.elapsed() < cooldown);
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        if self.live.contains(name) {
            return true;
        }
        let cooling = self.cooling.lock().unwrap();
        cooling
            .get(name)
            .map(|released| released.elapsed() < self.cooldown)
            .unwrap_or(false)
    }

    fn try_take(&self, name: &str) -> bool {
        {
            let cooling = self.cooling.lock().unwrap();
            if let Some(released) = cooling.get(name) {
                if released.elapsed() < self.cooldown {
                    return false;
                }
            }
        }
        self.live.insert(name.to_string())
    }
}

impl Default for SubdomainPool {
    fn default() -> Self {
        Self::new()
    }
}

fn gen_candidate(len: usize) -> String {
    (0..len)
        .map(|_| CHARSET[OsRng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Lowercase alphanumeric, 1..=63 chars, per the hostname label rules the
/// HTTP router depends on.
pub fn valid_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_shape() {
        let pool = SubdomainPool::new();
        let name = pool.allocate().unwrap();
        assert_eq!(name.len(), 8);
        assert!(valid_subdomain(&name));
        assert!(pool.is_reserved(&name));
    }

    #[test]
    fn test_claim_rejects_invalid_names() {
        let pool = SubdomainPool::new();
        assert!(pool.claim("Valid-Not").is_err());
        assert!(pool.claim("").is_err());
        assert!(pool.claim(&"a".repeat(64)).is_err());
        assert_eq!(pool.claim("MyApp1").unwrap(), "myapp1");
    }

    #[test]
    fn test_claim_taken_name_fails() {
        let pool = SubdomainPool::new();
        pool.claim("myapp").unwrap();
        assert!(matches!(
            pool.claim("myapp"),
            Err(Error::SubdomainUnavailable)
        ));
    }

    #[test]
    fn test_release_holds_name_through_cooldown() {
        let pool = SubdomainPool::with_cooldown(Duration::from_secs(60));
        pool.claim("myapp").unwrap();
        pool.release("myapp");

        // Still reserved: a stranger cannot take it.
        assert!(pool.is_reserved("myapp"));
        assert!(pool.claim("myapp").is_err());

        // The owner can.
        assert!(pool.reclaim("myapp"));
        assert!(pool.is_reserved("myapp"));
    }

    #[test]
    fn test_cooldown_expiry_frees_name() {
        let pool = SubdomainPool::with_cooldown(Duration::from_millis(0));
        pool.claim("myapp").unwrap();
        pool.release("myapp");

        pool.sweep();
        assert!(!pool.is_reserved("myapp"));
        assert!(pool.claim("myapp").is_ok());
    }
}
