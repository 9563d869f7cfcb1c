//! Custom-domain DNS validation.
//!
//! A domain proves ownership one of two ways: a CNAME pointing at the
//! server's base domain, or a TXT record carrying the one-time token the
//! server handed out (`_tunlink-challenge.<domain>`).

use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use tunlink_shared::{Error, Result};

/// Label prefix for TXT verification records.
pub const CHALLENGE_LABEL: &str = "_tunlink-challenge";

/// Resolver-backed validator.
pub struct DomainValidator {
    resolver: TokioAsyncResolver,
    base_domain: String,
}

impl DomainValidator {
    pub fn new(base_domain: &str) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Protocol(format!("resolver init: {e}")))?;
        Ok(Self {
            resolver,
            base_domain: base_domain.to_ascii_lowercase(),
        })
    }

    /// Mint a one-time verification token for the TXT flow.
    pub fn verification_token() -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Full validation: CNAME to the base domain, or TXT token match.
    pub async fn validate(&self, domain: &str, token: Option<&str>) -> Result<bool> {
        let domain = domain.to_ascii_lowercase();
        if self.cname_points_home(&domain).await? {
            return Ok(true);
        }
        if let Some(token) = token {
            return self.txt_matches(&domain, token).await;
        }
        Ok(false)
    }

    /// Does `domain` CNAME to the base domain (or a host under it)?
    pub async fn cname_points_home(&self, domain: &str) -> Result<bool> {
        use hickory_resolver::proto::rr::{RData, RecordType};

        let lookup = match self
            .resolver
            .lookup(format!("{domain}."), RecordType::CNAME)
            .await
        {
            Ok(lookup) => lookup,
            Err(err) => return absence_is_false(err),
        };

        for rdata in lookup.iter() {
            if let RData::CNAME(target) = rdata {
                let target = target.0.to_utf8();
                let target = target.trim_end_matches('.');
                if target.eq_ignore_ascii_case(&self.base_domain)
                    || target
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", self.base_domain))
                {
                    return Ok(true);
                }
                debug!(domain, target, "cname points elsewhere");
            }
        }
        Ok(false)
    }

    /// Does `_tunlink-challenge.<domain>` publish exactly `token`?
    pub async fn txt_matches(&self, domain: &str, token: &str) -> Result<bool> {
        let name = format!("{CHALLENGE_LABEL}.{domain}.");
        let lookup = match self.resolver.txt_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) => return absence_is_false(err),
        };

        for txt in lookup.iter() {
            for chunk in txt.txt_data() {
                if String::from_utf8_lossy(chunk) == token {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// NXDOMAIN and empty answers mean "not validated", not "error".
fn absence_is_false(err: hickory_resolver::error::ResolveError) -> Result<bool> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
        _ => Err(Error::Protocol(format!("dns lookup: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let a = DomainValidator::verification_token();
        let b = DomainValidator::verification_token();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
