//! Repository seam for durable tunnel state and request logs.
//!
//! The core treats persistence as best-effort: a live tunnel must keep
//! serving even when the backing store is down, so create/update failures
//! are logged and swallowed at the call sites, and request logs flow
//! through a bounded drop-oldest queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use tunlink_shared::Result;

use crate::tunnel::{TunnelRecord, TunnelStatus};

/// Budget for any one repository call on a serving path.
pub const REPO_BUDGET: Duration = Duration::from_secs(5);

/// Request-log queue depth; the oldest entry is dropped on overflow.
pub const LOG_QUEUE: usize = 10_000;

/// One served public request, for the append-only log.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub tunnel_id: Uuid,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub req_size: u64,
    pub resp_size: u64,
    pub at: DateTime<Utc>,
}

/// The persistence contract the core consumes.
#[async_trait]
pub trait TunnelRepository: Send + Sync {
    async fn create_tunnel(&self, record: &TunnelRecord) -> Result<()>;

    /// Reattach resolution: the record must belong to the presented user.
    async fn find_tunnel_by_id_for_user(
        &self,
        id: Uuid,
        user_id: Option<&str>,
    ) -> Result<Option<TunnelRecord>>;

    /// Cold-path custom-domain routing.
    async fn get_tunnel_by_custom_domain(&self, host: &str) -> Result<Option<TunnelRecord>>;

    async fn update_status(&self, id: Uuid, status: TunnelStatus) -> Result<()>;

    /// Durable sink for one request log row.
    async fn log_request(&self, log: RequestLog) -> Result<()>;
}

/// In-memory implementation; also the test double.
pub struct InMemoryRepository {
    tunnels: DashMap<Uuid, TunnelRecord>,
    logs: Mutex<Vec<RequestLog>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_custom_domain(&self, id: Uuid, domain: Option<String>) {
        if let Some(mut record) = self.tunnels.get_mut(&id) {
            record.custom_domain = domain.map(|d| d.to_ascii_lowercase());
        }
    }

    pub async fn log_count(&self) -> usize {
        self.logs.lock().await.len()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelRepository for InMemoryRepository {
    async fn create_tunnel(&self, record: &TunnelRecord) -> Result<()> {
        self.tunnels.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_tunnel_by_id_for_user(
        &self,
        id: Uuid,
        user_id: Option<&str>,
    ) -> Result<Option<TunnelRecord>> {
        Ok(self
            .tunnels
            .get(&id)
            .filter(|r| r.user_id.as_deref() == user_id)
            .map(|r| r.clone()))
    }

    async fn get_tunnel_by_custom_domain(&self, host: &str) -> Result<Option<TunnelRecord>> {
        let host = host.to_ascii_lowercase();
        Ok(self
            .tunnels
            .iter()
            .find(|r| r.custom_domain.as_deref() == Some(host.as_str()))
            .map(|r| r.clone()))
    }

    async fn update_status(&self, id: Uuid, status: TunnelStatus) -> Result<()> {
        if let Some(mut record) = self.tunnels.get_mut(&id) {
            record.status = status;
            record.last_active_at = Utc::now();
        }
        Ok(())
    }

    async fn log_request(&self, log: RequestLog) -> Result<()> {
        if let Some(mut record) = self.tunnels.get_mut(&log.tunnel_id) {
            record.request_count += 1;
            record.last_active_at = log.at;
        }
        self.logs.lock().await.push(log);
        Ok(())
    }
}

/// Bounded front of `log_request`: serving paths push and move on; one
/// worker drains into the repository.
#[derive(Clone)]
pub struct RequestLogger {
    queue: Arc<std::sync::Mutex<VecDeque<RequestLog>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl RequestLogger {
    pub fn new(repo: Arc<dyn TunnelRepository>) -> Self {
        Self::with_capacity(repo, LOG_QUEUE)
    }

    pub fn with_capacity(repo: Arc<dyn TunnelRepository>, capacity: usize) -> Self {
        let logger = Self {
            queue: Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(capacity))),
            notify: Arc::new(Notify::new()),
            capacity,
        };
        logger.spawn_worker(repo);
        logger
    }

    /// Enqueue without blocking; drops the oldest entry when full.
    pub fn push(&self, log: RequestLog) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                debug!("request-log queue full, dropping oldest entry");
            }
            queue.push_back(log);
        }
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn spawn_worker(&self, repo: Arc<dyn TunnelRepository>) {
        let queue = self.queue.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                loop {
                    let next = queue.lock().unwrap().pop_front();
                    let Some(log) = next else { break };
                    if let Err(err) = repo.log_request(log).await {
                        warn!(%err, "request log write failed");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunlink_shared::TunnelProtocol;

    fn record(user: Option<&str>) -> TunnelRecord {
        TunnelRecord::new(
            user.map(String::from),
            "ab12cd34".into(),
            TunnelProtocol::Http,
            "http://localhost:3000".into(),
        )
    }

    fn log(tunnel_id: Uuid) -> RequestLog {
        RequestLog {
            tunnel_id,
            method: "GET".into(),
            path: "/ping".into(),
            status: 200,
            latency_ms: 3,
            req_size: 0,
            resp_size: 4,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_find_checks_owner() {
        let repo = InMemoryRepository::new();
        let r = record(Some("user-1"));
        repo.create_tunnel(&r).await.unwrap();

        assert!(repo
            .find_tunnel_by_id_for_user(r.id, Some("user-1"))
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_tunnel_by_id_for_user(r.id, Some("user-2"))
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_tunnel_by_id_for_user(r.id, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_custom_domain_lookup_is_case_insensitive() {
        let repo = InMemoryRepository::new();
        let r = record(Some("user-1"));
        repo.create_tunnel(&r).await.unwrap();
        repo.set_custom_domain(r.id, Some("Example.COM".into()));

        let found = repo.get_tunnel_by_custom_domain("EXAMPLE.com").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(r.id));
    }

    #[tokio::test]
    async fn test_logger_drops_oldest_on_overflow() {
        // Worker that never drains: use a repo behind a never-notified task
        // by filling faster than the worker can observe.
        let repo = Arc::new(InMemoryRepository::new());
        let logger = RequestLogger::with_capacity(repo.clone(), 2);
        let id = Uuid::new_v4();

        // Push synchronously before yielding to the worker.
        let mut first = log(id);
        first.path = "/first".into();
        logger.push(first);
        logger.push(log(id));
        logger.push(log(id));
        {
            let queue = logger.queue.lock().unwrap();
            assert!(queue.len() <= 2);
            assert!(queue.iter().all(|l| l.path != "/first"));
        }
    }

    #[tokio::test]
    async fn test_logger_drains_to_repository() {
        let repo = Arc::new(InMemoryRepository::new());
        let logger = RequestLogger::with_capacity(repo.clone(), 16);
        logger.push(log(Uuid::new_v4()));
        logger.push(log(Uuid::new_v4()));

        // Give the worker a few turns.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if repo.log_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(repo.log_count().await, 2);
        assert_eq!(logger.depth(), 0);
    }
}
