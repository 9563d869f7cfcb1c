//! In-memory tunnel index: subdomain, public port, and custom domain.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::tunnel::TunnelConnection;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("subdomain already registered: {0}")]
    SubdomainTaken(String),

    #[error("public port already registered: {0}")]
    PortTaken(u16),

    #[error("custom domain already registered: {0}")]
    DomainTaken(String),
}

/// Process-wide index of live tunnels. Sharded concurrent maps; no lock is
/// held across I/O.
pub struct TunnelRegistry {
    by_subdomain: DashMap<String, Arc<TunnelConnection>>,
    by_port: DashMap<u16, Arc<TunnelConnection>>,
    /// custom domain -> subdomain
    custom_domains: DashMap<String, String>,
    /// Paused tunnels awaiting reattach: id -> (subdomain, paused_at).
    paused: DashMap<Uuid, (String, Instant)>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            by_subdomain: DashMap::new(),
            by_port: DashMap::new(),
            custom_domains: DashMap::new(),
            paused: DashMap::new(),
        }
    }

    /// Register a live connection under its subdomain (and port, for L4).
    pub fn insert(&self, conn: Arc<TunnelConnection>) -> Result<(), RegistryError> {
        if self.by_subdomain.contains_key(&conn.subdomain) {
            return Err(RegistryError::SubdomainTaken(conn.subdomain.clone()));
        }
        if let Some(port) = conn.public_port {
            if self.by_port.contains_key(&port) {
                return Err(RegistryError::PortTaken(port));
            }
            self.by_port.insert(port, conn.clone());
        }
        self.paused.remove(&conn.id);
        self.by_subdomain.insert(conn.subdomain.clone(), conn);
        Ok(())
    }

    /// Drop a live connection from every index. Custom-domain aliases stay;
    /// they resolve again when the tunnel reattaches.
    pub fn remove(&self, subdomain: &str) -> Option<Arc<TunnelConnection>> {
        let (_, conn) = self.by_subdomain.remove(subdomain)?;
        if let Some(port) = conn.public_port {
            self.by_port.remove(&port);
        }
        self.paused
            .insert(conn.id, (subdomain.to_string(), Instant::now()));
        Some(conn)
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<TunnelConnection>> {
        self.by_subdomain.get(subdomain).map(|e| e.clone())
    }

    pub fn get_by_port(&self, port: u16) -> Option<Arc<TunnelConnection>> {
        self.by_port.get(&port).map(|e| e.clone())
    }

    pub fn count(&self) -> usize {
        self.by_subdomain.len()
    }

    /// Alias a verified custom domain to a subdomain.
    pub fn assign_custom_domain(
        &self,
        domain: &str,
        subdomain: &str,
    ) -> Result<(), RegistryError> {
        let domain = domain.to_ascii_lowercase();
        if let Some(existing) = self.custom_domains.get(&domain) {
            if existing.value() != subdomain {
                return Err(RegistryError::DomainTaken(domain));
            }
            return Ok(());
        }
        self.custom_domains.insert(domain, subdomain.to_string());
        Ok(())
    }

    pub fn remove_custom_domain(&self, domain: &str) {
        self.custom_domains.remove(&domain.to_ascii_lowercase());
    }

    /// Resolve a public `Host` value to a live connection: subdomain first,
    /// then the custom-domain index.
    pub fn resolve_host(&self, host: &str, base_domain: &str) -> Option<Arc<TunnelConnection>> {
        let host = normalize_host(host);

        if let Some(sub) = subdomain_of(&host, base_domain) {
            if let Some(conn) = self.get(sub) {
                return Some(conn);
            }
        }

        let sub = self.custom_domains.get(host.as_str())?.clone();
        self.get(&sub)
    }

    /// Whether a custom domain is currently aliased at all.
    pub fn custom_domain_target(&self, domain: &str) -> Option<String> {
        self.custom_domains
            .get(&domain.to_ascii_lowercase())
            .map(|e| e.clone())
    }

    /// Reattach window bookkeeping: take a paused entry if it exists.
    pub fn take_paused(&self, id: &Uuid) -> Option<(String, Instant)> {
        self.paused.remove(id).map(|(_, v)| v)
    }

    /// Paused tunnels older than `max_age`, for the delete sweeper.
    pub fn expired_paused(&self, max_age: std::time::Duration) -> Vec<(Uuid, String)> {
        let expired: Vec<(Uuid, String)> = self
            .paused
            .iter()
            .filter(|e| e.value().1.elapsed() >= max_age)
            .map(|e| (*e.key(), e.value().0.clone()))
            .collect();
        for (id, _) in &expired {
            self.paused.remove(id);
        }
        expired
    }

    /// Snapshot of every live connection, for the sweepers.
    pub fn connections(&self) -> Vec<Arc<TunnelConnection>> {
        self.by_subdomain.iter().map(|e| e.value().clone()).collect()
    }

    /// Close every live tunnel, for shutdown.
    pub fn close_all(&self) {
        for entry in self.by_subdomain.iter() {
            entry.value().close();
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase and strip any `:port` suffix.
pub fn normalize_host(host: &str) -> String {
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        // Keep IPv6 literals intact; only strip numeric ports.
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    host.to_ascii_lowercase()
}

/// The subdomain label, when `host` is `<label>.<base>` or `<label>.localhost`.
pub fn subdomain_of<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let (label, suffix) = host.split_once('.')?;
    if label.is_empty() {
        return None;
    }
    if suffix.eq_ignore_ascii_case(base_domain) || suffix == "localhost" {
        Some(label)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelConnection, TunnelRecord};
    use tunlink_shared::{RateLimits, TunnelProtocol};

    fn conn(subdomain: &str, port: Option<u16>) -> Arc<TunnelConnection> {
        let mut record = TunnelRecord::new(
            None,
            subdomain.into(),
            if port.is_some() {
                TunnelProtocol::Tcp
            } else {
                TunnelProtocol::Http
            },
            "http://localhost:3000".into(),
        );
        record.public_port = port;
        let (conn, _rx) = TunnelConnection::new(&record, RateLimits::default());
        conn
    }

    #[test]
    fn test_subdomain_uniqueness() {
        let registry = TunnelRegistry::new();
        registry.insert(conn("ab12cd34", None)).unwrap();
        assert_eq!(
            registry.insert(conn("ab12cd34", None)),
            Err(RegistryError::SubdomainTaken("ab12cd34".into()))
        );
    }

    #[test]
    fn test_port_uniqueness() {
        let registry = TunnelRegistry::new();
        registry.insert(conn("aaaa1111", Some(20000))).unwrap();
        assert_eq!(
            registry.insert(conn("bbbb2222", Some(20000))),
            Err(RegistryError::PortTaken(20000))
        );
    }

    #[test]
    fn test_resolve_by_subdomain_and_custom_domain() {
        let registry = TunnelRegistry::new();
        registry.insert(conn("ab12cd34", None)).unwrap();

        assert!(registry
            .resolve_host("ab12cd34.tunlink.dev:8055", "tunlink.dev")
            .is_some());
        assert!(registry
            .resolve_host("AB12CD34.LOCALHOST", "tunlink.dev")
            .is_some());
        assert!(registry.resolve_host("other.example.com", "tunlink.dev").is_none());

        registry.assign_custom_domain("example.com", "ab12cd34").unwrap();
        assert!(registry.resolve_host("Example.COM", "tunlink.dev").is_some());

        registry.remove_custom_domain("example.com");
        assert!(registry.resolve_host("example.com", "tunlink.dev").is_none());
    }

    #[test]
    fn test_custom_domain_uniqueness() {
        let registry = TunnelRegistry::new();
        registry.assign_custom_domain("example.com", "aaaa1111").unwrap();
        // Re-assigning the same target is idempotent.
        registry.assign_custom_domain("example.com", "aaaa1111").unwrap();
        assert_eq!(
            registry.assign_custom_domain("example.com", "bbbb2222"),
            Err(RegistryError::DomainTaken("example.com".into()))
        );
    }

    #[test]
    fn test_remove_frees_port_and_tracks_paused() {
        let registry = TunnelRegistry::new();
        let c = conn("aaaa1111", Some(20001));
        let id = c.id;
        registry.insert(c).unwrap();

        let removed = registry.remove("aaaa1111").unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.get_by_port(20001).is_none());
        assert!(registry.take_paused(&id).is_some());
        assert!(registry.take_paused(&id).is_none());
    }

    #[test]
    fn test_bare_base_domain_is_not_a_tunnel() {
        let registry = TunnelRegistry::new();
        registry.insert(conn("ab12cd34", None)).unwrap();
        assert!(registry.resolve_host("tunlink.dev", "tunlink.dev").is_none());
    }
}
