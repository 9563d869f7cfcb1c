//! Admission: validating a link's `init` frame into a tunnel grant.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use tunlink_shared::{Error, RateLimits, Result, TunnelProtocol};

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::dns::DomainValidator;
use crate::ip_filter::IpAllowList;
use crate::ports::PortAllocator;
use crate::repository::{TunnelRepository, REPO_BUDGET};
use crate::subdomain::SubdomainPool;
use crate::tunnel::{TunnelRecord, TunnelStatus};

/// The `init` frame, flattened for the admission decision.
#[derive(Debug, Clone)]
pub struct InitRequest {
    pub protocol: TunnelProtocol,
    pub local_url: String,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub subdomain: Option<String>,
    pub tunnel_id: Option<String>,
    pub host: Option<String>,
    pub force_new: bool,
}

/// A successful admission.
#[derive(Debug)]
pub struct Grant {
    pub record: TunnelRecord,
    pub limits: RateLimits,
    pub reattached: bool,
}

/// Decides who gets a tunnel and under which handle.
pub struct Admission {
    config: Arc<ServerConfig>,
    validator: Arc<dyn TokenValidator>,
    pool: Arc<SubdomainPool>,
    ports: Arc<PortAllocator>,
    repo: Arc<dyn TunnelRepository>,
    domains: Option<Arc<DomainValidator>>,
}

impl Admission {
    pub fn new(
        config: Arc<ServerConfig>,
        validator: Arc<dyn TokenValidator>,
        pool: Arc<SubdomainPool>,
        ports: Arc<PortAllocator>,
        repo: Arc<dyn TunnelRepository>,
        domains: Option<Arc<DomainValidator>>,
    ) -> Self {
        Self {
            config,
            validator,
            pool,
            ports,
            repo,
            domains,
        }
    }

    /// Run the full admission sequence. `query_token` is the `token=`
    /// upgrade parameter, taken when the init frame carries none.
    pub async fn admit(&self, init: InitRequest, query_token: Option<&str>) -> Result<Grant> {
        let (user_id, limits) = self.authenticate(&init, query_token)?;

        // Reattach beats everything except force_new.
        if !init.force_new {
            if let Some(grant) = self.try_reattach(&init, user_id.as_deref(), limits).await? {
                return Ok(grant);
            }
        }

        let subdomain = match init.subdomain.as_deref() {
            Some(requested) => match self.pool.claim(requested) {
                Ok(name) => name,
                // Requested-but-taken falls back to a minted name.
                Err(Error::SubdomainUnavailable) => self.pool.allocate()?,
                Err(e) => return Err(e),
            },
            None => self.pool.allocate()?,
        };

        let mut record = TunnelRecord::new(
            user_id,
            subdomain.clone(),
            init.protocol,
            init.local_url.clone(),
        );

        if init.protocol.needs_port() {
            match self.ports.allocate() {
                Ok(port) => record.public_port = Some(port),
                Err(e) => {
                    self.pool.release(&subdomain);
                    return Err(e);
                }
            }
        }

        if let Some(host) = init.host.as_deref() {
            self.grant_custom_host(&mut record, host).await?;
        }

        // Best-effort persistence: a dead store must not block a live tunnel.
        match timeout(REPO_BUDGET, self.repo.create_tunnel(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "tunnel record create failed"),
            Err(_) => warn!("tunnel record create timed out"),
        }

        info!(
            tunnel_id = %record.id,
            subdomain = %record.subdomain,
            protocol = %record.protocol,
            user = record.user_id.as_deref().unwrap_or("anonymous"),
            "tunnel admitted"
        );

        Ok(Grant {
            record,
            limits,
            reattached: false,
        })
    }

    /// Auth precedence: API key, then JWT, then anonymous defaults.
    fn authenticate(
        &self,
        init: &InitRequest,
        query_token: Option<&str>,
    ) -> Result<(Option<String>, RateLimits)> {
        if let Some(api_key) = init.api_key.as_deref() {
            let (user_id, per_minute, per_day) = self.validator.validate_api_key(api_key)?;
            let mut limits = self.config.default_limits;
            limits.per_minute = per_minute;
            limits.per_day = per_day;
            return Ok((Some(user_id), limits));
        }

        if let Some(token) = init.token.as_deref().or(query_token) {
            let user_id = self.validator.validate_token(token)?;
            return Ok((Some(user_id), self.config.default_limits));
        }

        Ok((None, self.config.default_limits))
    }

    async fn try_reattach(
        &self,
        init: &InitRequest,
        user_id: Option<&str>,
        limits: RateLimits,
    ) -> Result<Option<Grant>> {
        let Some(id_text) = init.tunnel_id.as_deref() else {
            return Ok(None);
        };
        let id = Uuid::parse_str(id_text)
            .map_err(|_| Error::AdmissionRejected(format!("invalid tunnel_id: {id_text}")))?;

        let found = match timeout(REPO_BUDGET, self.repo.find_tunnel_by_id_for_user(id, user_id))
            .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                warn!(%err, "reattach lookup failed");
                None
            }
            Err(_) => {
                warn!("reattach lookup timed out");
                None
            }
        };

        let Some(mut record) = found else {
            return Ok(None);
        };
        if record.status != TunnelStatus::Paused {
            return Ok(None);
        }
        if !self.pool.reclaim(&record.subdomain) {
            // Reservation expired and somebody else took the name.
            return Ok(None);
        }

        // Reuse the original port when the slot is still free.
        if let Some(port) = record.public_port {
            if !self.ports.claim(port) {
                match self.ports.allocate() {
                    Ok(fresh) => {
                        info!(tunnel_id = %record.id, old = port, new = fresh, "reattach moved port");
                        record.public_port = Some(fresh);
                    }
                    Err(e) => {
                        self.pool.release(&record.subdomain);
                        return Err(e);
                    }
                }
            }
        }

        record.status = TunnelStatus::Active;
        record.local_url = init.local_url.clone();

        match timeout(REPO_BUDGET, self.repo.update_status(record.id, TunnelStatus::Active)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "reattach status update failed"),
            Err(_) => warn!("reattach status update timed out"),
        }

        info!(
            tunnel_id = %record.id,
            subdomain = %record.subdomain,
            "tunnel reattached"
        );

        Ok(Some(Grant {
            record,
            limits,
            reattached: true,
        }))
    }

    /// `init.host` asks for a specific custom domain; granted only to L7
    /// tunnels whose domain already CNAMEs to the base.
    async fn grant_custom_host(&self, record: &mut TunnelRecord, host: &str) -> Result<()> {
        if record.protocol != TunnelProtocol::Http {
            return Err(Error::AdmissionRejected(
                "custom hosts apply to http tunnels only".into(),
            ));
        }
        let Some(domains) = self.domains.as_ref() else {
            return Err(Error::AdmissionRejected(
                "custom hosts are not enabled".into(),
            ));
        };
        let verified = domains.cname_points_home(&host.to_ascii_lowercase()).await?;
        if !verified {
            return Err(Error::AdmissionRejected(format!(
                "host {host} does not resolve to {}",
                self.config.base_domain
            )));
        }
        record.custom_domain = Some(host.to_ascii_lowercase());
        Ok(())
    }
}

/// Exact-match origin gate on the upgrade request. Empty set allows any.
pub fn check_origin(config: &ServerConfig, origin: Option<&str>) -> Result<()> {
    if config.allowed_origins.is_empty() {
        return Ok(());
    }
    match origin {
        Some(origin) if config.allowed_origins.iter().any(|o| o == origin) => Ok(()),
        Some(origin) => Err(Error::AdmissionRejected(format!(
            "origin not allowed: {origin}"
        ))),
        None => Err(Error::AdmissionRejected("origin header required".into())),
    }
}

/// IP gate on the underlying TCP peer.
pub fn check_peer(allow: &IpAllowList, peer: IpAddr) -> Result<()> {
    if allow.is_allowed(peer) {
        Ok(())
    } else {
        Err(Error::AdmissionRejected(format!("peer not allowed: {peer}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecretValidator;
    use crate::repository::InMemoryRepository;

    fn harness() -> (Admission, Arc<InMemoryRepository>, Arc<SubdomainPool>, Arc<PortAllocator>) {
        let mut config = ServerConfig::from_env();
        config.base_domain = "tunlink.dev".into();
        let repo = Arc::new(InMemoryRepository::new());
        let pool = Arc::new(SubdomainPool::new());
        let ports = Arc::new(PortAllocator::new((20000, 20010)));
        let admission = Admission::new(
            Arc::new(config),
            Arc::new(SecretValidator::new(None, None)),
            pool.clone(),
            ports.clone(),
            repo.clone(),
            None,
        );
        (admission, repo, pool, ports)
    }

    fn init(protocol: TunnelProtocol) -> InitRequest {
        InitRequest {
            protocol,
            local_url: "http://localhost:3000".into(),
            token: None,
            api_key: None,
            subdomain: None,
            tunnel_id: None,
            host: None,
            force_new: false,
        }
    }

    #[tokio::test]
    async fn test_anonymous_http_admission() {
        let (admission, _repo, pool, _ports) = harness();
        let grant = admission.admit(init(TunnelProtocol::Http), None).await.unwrap();
        assert_eq!(grant.record.subdomain.len(), 8);
        assert!(grant.record.public_port.is_none());
        assert!(grant.record.user_id.is_none());
        assert!(!grant.reattached);
        assert!(pool.is_reserved(&grant.record.subdomain));
    }

    #[tokio::test]
    async fn test_l4_admission_allocates_port() {
        let (admission, _repo, _pool, ports) = harness();
        let grant = admission.admit(init(TunnelProtocol::Tcp), None).await.unwrap();
        assert_eq!(grant.record.public_port, Some(20000));
        assert_eq!(ports.allocated(), 1);
    }

    #[tokio::test]
    async fn test_requested_subdomain_taken_falls_back_to_minted() {
        let (admission, _repo, pool, _ports) = harness();
        pool.claim("myapp").unwrap();

        let mut req = init(TunnelProtocol::Http);
        req.subdomain = Some("myapp".into());
        let grant = admission.admit(req, None).await.unwrap();
        assert_ne!(grant.record.subdomain, "myapp");
        assert_eq!(grant.record.subdomain.len(), 8);
    }

    #[tokio::test]
    async fn test_reattach_reuses_subdomain_and_port() {
        let (admission, repo, pool, _ports) = harness();
        let grant = admission.admit(init(TunnelProtocol::Tcp), None).await.unwrap();
        let id = grant.record.id;
        let subdomain = grant.record.subdomain.clone();
        let port = grant.record.public_port.unwrap();

        // Simulate link loss.
        pool.release(&subdomain);
        _ports.release(port);
        repo.update_status(id, TunnelStatus::Paused).await.unwrap();

        let mut req = init(TunnelProtocol::Tcp);
        req.tunnel_id = Some(id.to_string());
        let grant = admission.admit(req, None).await.unwrap();
        assert!(grant.reattached);
        assert_eq!(grant.record.id, id);
        assert_eq!(grant.record.subdomain, subdomain);
        assert_eq!(grant.record.public_port, Some(port));
    }

    #[tokio::test]
    async fn test_force_new_skips_reattach() {
        let (admission, repo, pool, _ports) = harness();
        let grant = admission.admit(init(TunnelProtocol::Http), None).await.unwrap();
        let id = grant.record.id;
        pool.release(&grant.record.subdomain);
        repo.update_status(id, TunnelStatus::Paused).await.unwrap();

        let mut req = init(TunnelProtocol::Http);
        req.tunnel_id = Some(id.to_string());
        req.force_new = true;
        let fresh = admission.admit(req, None).await.unwrap();
        assert!(!fresh.reattached);
        assert_ne!(fresh.record.id, id);
        assert_ne!(fresh.record.subdomain, grant.record.subdomain);
    }

    #[tokio::test]
    async fn test_reattach_of_active_record_is_refused() {
        let (admission, _repo, _pool, _ports) = harness();
        let grant = admission.admit(init(TunnelProtocol::Http), None).await.unwrap();

        // Status is still active: the reattach path must not trigger.
        let mut req = init(TunnelProtocol::Http);
        req.tunnel_id = Some(grant.record.id.to_string());
        let second = admission.admit(req, None).await.unwrap();
        assert!(!second.reattached);
        assert_ne!(second.record.subdomain, grant.record.subdomain);
    }

    #[tokio::test]
    async fn test_port_exhaustion_releases_subdomain() {
        let mut config = ServerConfig::from_env();
        config.base_domain = "tunlink.dev".into();
        let repo = Arc::new(InMemoryRepository::new());
        let pool = Arc::new(SubdomainPool::new());
        let ports = Arc::new(PortAllocator::new((20000, 20000)));
        let admission = Admission::new(
            Arc::new(config),
            Arc::new(SecretValidator::new(None, None)),
            pool.clone(),
            ports.clone(),
            repo,
            None,
        );

        admission.admit(init(TunnelProtocol::Tcp), None).await.unwrap();
        let err = admission.admit(init(TunnelProtocol::Tcp), None).await.unwrap_err();
        assert!(matches!(err, Error::PortExhausted));
    }

    struct StubValidator;

    impl crate::auth::TokenValidator for StubValidator {
        fn validate_token(&self, token: &str) -> tunlink_shared::Result<String> {
            if token == "good-jwt" {
                Ok("jwt-user".into())
            } else {
                Err(Error::AdmissionRejected("invalid token".into()))
            }
        }

        fn validate_api_key(&self, key: &str) -> tunlink_shared::Result<(String, u32, u32)> {
            if key == "good-key" {
                Ok(("key-user".into(), 5, 500))
            } else {
                Err(Error::AdmissionRejected("invalid api key".into()))
            }
        }
    }

    fn stub_harness() -> Admission {
        let mut config = ServerConfig::from_env();
        config.base_domain = "tunlink.dev".into();
        Admission::new(
            Arc::new(config),
            Arc::new(StubValidator),
            Arc::new(SubdomainPool::new()),
            Arc::new(PortAllocator::new((20000, 20010))),
            Arc::new(InMemoryRepository::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_api_key_stamps_limits_and_beats_token() {
        let admission = stub_harness();
        let mut req = init(TunnelProtocol::Http);
        req.api_key = Some("good-key".into());
        req.token = Some("good-jwt".into());

        let grant = admission.admit(req, None).await.unwrap();
        assert_eq!(grant.record.user_id.as_deref(), Some("key-user"));
        assert_eq!(grant.limits.per_minute, 5);
        assert_eq!(grant.limits.per_day, 500);
    }

    #[tokio::test]
    async fn test_query_token_stands_in_for_init_token() {
        let admission = stub_harness();
        let grant = admission
            .admit(init(TunnelProtocol::Http), Some("good-jwt"))
            .await
            .unwrap();
        assert_eq!(grant.record.user_id.as_deref(), Some("jwt-user"));
    }

    #[tokio::test]
    async fn test_bad_credentials_reject() {
        let admission = stub_harness();
        let mut req = init(TunnelProtocol::Http);
        req.api_key = Some("wrong".into());
        assert!(matches!(
            admission.admit(req, None).await,
            Err(Error::AdmissionRejected(_))
        ));

        let mut req = init(TunnelProtocol::Http);
        req.token = Some("wrong".into());
        assert!(matches!(
            admission.admit(req, None).await,
            Err(Error::AdmissionRejected(_))
        ));
    }

    #[test]
    fn test_origin_gate() {
        let mut config = ServerConfig::from_env();
        config.allowed_origins = vec!["https://app.tunlink.dev".into()];
        assert!(check_origin(&config, Some("https://app.tunlink.dev")).is_ok());
        assert!(check_origin(&config, Some("https://evil.example")).is_err());
        assert!(check_origin(&config, None).is_err());

        config.allowed_origins.clear();
        assert!(check_origin(&config, None).is_ok());
    }

    #[test]
    fn test_peer_gate() {
        let allow = IpAllowList::from_strings(&["10.0.0.0/8".to_string()]);
        assert!(check_peer(&allow, "10.1.2.3".parse().unwrap()).is_ok());
        assert!(check_peer(&allow, "192.168.0.1".parse().unwrap()).is_err());
    }
}
