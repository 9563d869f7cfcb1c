//! Server configuration from environment variables.

use std::time::Duration;

use tunlink_shared::RateLimits;

/// Everything the server reads from its environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public HTTP port, also the control-upgrade port.
    pub port: u16,
    /// Base domain that subdomains hang off.
    pub base_domain: String,
    /// HS256 secret for `ValidateToken`.
    pub jwt_secret: Option<String>,
    /// HMAC secret for `ValidateAPIKey`.
    pub api_key_secret: Option<String>,
    /// Consumed by a durable repository implementation, if one is plugged in.
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Exact-match `Origin` allow-list for the upgrade. Empty = allow any.
    pub allowed_origins: Vec<String>,
    /// CIDR allow-list for the upgrade peer. Empty = allow any.
    pub ip_whitelist: Vec<String>,
    /// Reserved public port range for TCP/TLS/UDP tunnels, inclusive.
    pub port_range: (u16, u16),
    /// How long an HTTP request waits for its response frame.
    pub request_timeout: Duration,
    /// Limits for tunnels without API-key stamps.
    pub default_limits: RateLimits,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env_parse("PORT", 8055);
        let base_domain =
            std::env::var("TUNNEL_BASE_DOMAIN").unwrap_or_else(|_| "localhost".to_string());

        let port_range = std::env::var("TUNNEL_PORT_RANGE")
            .ok()
            .and_then(|s| parse_port_range(&s))
            .unwrap_or((20000, 25000));

        Self {
            port,
            base_domain,
            jwt_secret: env_nonempty("JWT_SECRET"),
            api_key_secret: env_nonempty("API_KEY_SECRET"),
            database_url: env_nonempty("DATABASE_URL"),
            redis_url: env_nonempty("REDIS_URL"),
            allowed_origins: env_list("TUNNEL_ORIGINS"),
            ip_whitelist: env_list("IP_WHITELIST"),
            port_range,
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 60)),
            default_limits: RateLimits::default(),
        }
    }

    /// Public URL for an HTTP tunnel on this server.
    pub fn public_url(&self, subdomain: &str) -> String {
        if self.port == 80 {
            format!("http://{}.{}", subdomain, self.base_domain)
        } else {
            format!("http://{}.{}:{}", subdomain, self.base_domain, self.port)
        }
    }

    /// Public address for an L4 tunnel on this server.
    pub fn public_addr(&self, public_port: u16) -> String {
        format!("{}:{}", self.base_domain, public_port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (lo, hi) = s.split_once('-')?;
    let lo: u16 = lo.trim().parse().ok()?;
    let hi: u16 = hi.trim().parse().ok()?;
    (lo <= hi).then_some((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("20000-25000"), Some((20000, 25000)));
        assert_eq!(parse_port_range("9000 - 9100"), Some((9000, 9100)));
        assert_eq!(parse_port_range("9100-9000"), None);
        assert_eq!(parse_port_range("nope"), None);
    }

    #[test]
    fn test_public_url_keeps_nonstandard_port() {
        let mut config = ServerConfig::from_env();
        config.base_domain = "tunlink.dev".into();
        config.port = 8055;
        assert_eq!(config.public_url("ab12cd34"), "http://ab12cd34.tunlink.dev:8055");
        config.port = 80;
        assert_eq!(config.public_url("ab12cd34"), "http://ab12cd34.tunlink.dev");
    }
}
