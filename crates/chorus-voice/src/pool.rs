//! Node pool: health-filtered, region-aware, load-ranked selection,
//! plus the rate-limited failover queue that spreads re-homing work
//! after a node outage or gateway reconnect.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chorus_config::PoolConfig;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::node::{ConnectionState, NodeConnection, NodeEvent, NodeOptions};

// ---------------------------------------------------------------------------
// Failover queue
// ---------------------------------------------------------------------------

/// A deferred re-homing job.
pub type FailoverJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct FailoverInner {
    rate: Duration,
    limit: usize,
    queue: Mutex<VecDeque<FailoverJob>>,
    /// True while a job is running or a drain is scheduled.
    active: AtomicBool,
}

/// Paces re-homing jobs: the first job in an idle queue runs
/// immediately, the rest drain at `limit` jobs per `rate` window in
/// submission order.
#[derive(Clone)]
pub struct FailoverQueue {
    inner: Arc<FailoverInner>,
}

impl FailoverQueue {
    pub fn new(rate: Duration, limit: usize) -> Self {
        Self {
            inner: Arc::new(FailoverInner {
                rate,
                limit: limit.max(1),
                queue: Mutex::new(VecDeque::new()),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Run `job` now when idle, otherwise defer it to a later window.
    pub async fn submit(&self, job: FailoverJob) {
        {
            let mut queue = self.inner.queue.lock().await;
            if !queue.is_empty() || self.inner.active.swap(true, Ordering::AcqRel) {
                queue.push_back(job);
                return;
            }
        }

        job.await;
        self.spawn_drain();
    }

    /// Jobs waiting for a window.
    pub async fn backlog(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    fn spawn_drain(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.rate).await;

                let batch: Vec<FailoverJob> = {
                    let mut queue = inner.queue.lock().await;
                    let take = inner.limit.min(queue.len());
                    queue.drain(..take).collect()
                };
                for job in batch {
                    job.await;
                }

                if inner.queue.lock().await.is_empty() {
                    inner.active.store(false, Ordering::Release);
                    // A submit may have queued between the check and the
                    // flag flip; reclaim and keep draining if so.
                    if !inner.queue.lock().await.is_empty()
                        && !inner.active.swap(true, Ordering::AcqRel)
                    {
                        continue;
                    }
                    return;
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// The set of known backend nodes, keyed by `host:port`.
pub struct NodePool {
    nodes: RwLock<HashMap<String, NodeConnection>>,
    failover: FailoverQueue,
    events_tx: mpsc::Sender<NodeEvent>,
}

impl NodePool {
    pub fn new(config: &PoolConfig, events_tx: mpsc::Sender<NodeEvent>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            failover: FailoverQueue::new(
                Duration::from_millis(config.failover_rate_ms),
                config.failover_limit,
            ),
            events_tx,
        }
    }

    pub fn failover_queue(&self) -> FailoverQueue {
        self.failover.clone()
    }

    /// Register a node and open its connection. Host keys are unique;
    /// adding a known key returns the existing connection untouched.
    pub async fn add_node(&self, options: NodeOptions) -> NodeConnection {
        let key = options.key();
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&key) {
            warn!(node = %key, "node already registered, keeping existing connection");
            return existing.clone();
        }
        let node = NodeConnection::new(options);
        node.connect(self.events_tx.clone());
        nodes.insert(key.clone(), node.clone());
        info!(node = %key, "node added to pool");
        node
    }

    /// Destroy and remove a node. Returns false when the key is unknown.
    pub async fn remove_node(&self, key: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.remove(key) {
            Some(node) => {
                node.destroy();
                info!(node = %key, "node removed from pool");
                true
            }
            None => false,
        }
    }

    pub async fn node(&self, key: &str) -> Option<NodeConnection> {
        self.nodes.read().await.get(key).cloned()
    }

    pub async fn nodes(&self) -> Vec<NodeConnection> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Pick the healthiest node for a region.
    ///
    /// Candidates are Connected (not Draining) nodes; when any match
    /// the requested region the choice narrows to those, otherwise all
    /// candidates stay in play. Lowest computed load wins. `None`
    /// means no eligible node exists; that is the caller's failure to
    /// report, not a retryable condition here.
    pub async fn select_node(&self, region: Option<&str>) -> Option<NodeConnection> {
        let nodes = self.nodes.read().await;
        let mut candidates = Vec::new();
        for node in nodes.values() {
            if node.state().await == ConnectionState::Connected {
                candidates.push(node.clone());
            }
        }
        drop(nodes);

        if let Some(region) = region {
            let regional: Vec<NodeConnection> = candidates
                .iter()
                .filter(|n| n.region() == Some(region))
                .cloned()
                .collect();
            if !regional.is_empty() {
                candidates = regional;
            } else {
                debug!(region, "no node in requested region, falling back to any");
            }
        }

        let mut best: Option<(f64, NodeConnection)> = None;
        for node in candidates {
            let penalty = node.stats().await.load_penalty();
            match &best {
                Some((lowest, _)) if *lowest <= penalty => {}
                _ => best = Some((penalty, node)),
            }
        }
        best.map(|(_, node)| node)
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, node: NodeConnection) {
        self.nodes.write().await.insert(node.key(), node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CpuStats, NodeStats};
    use std::sync::atomic::AtomicUsize;

    fn options(host: &str, region: Option<&str>) -> NodeOptions {
        NodeOptions {
            host: host.into(),
            port: 2333,
            password: "pw".into(),
            region: region.map(String::from),
            shard_count: 1,
            user_id: "bot".into(),
        }
    }

    async fn test_node(
        pool: &NodePool,
        host: &str,
        region: Option<&str>,
        state: ConnectionState,
        system_load: f64,
    ) -> NodeConnection {
        let node = NodeConnection::new(options(host, region));
        node.set_state(state).await;
        node.set_stats(NodeStats {
            cpu: Some(CpuStats {
                cores: 1,
                system_load,
            }),
            ..NodeStats::default()
        })
        .await;
        pool.insert_for_test(node.clone()).await;
        node
    }

    fn test_pool() -> NodePool {
        let (tx, _rx) = mpsc::channel(16);
        NodePool::new(&PoolConfig::default(), tx)
    }

    #[tokio::test]
    async fn selects_lowest_load_in_region() {
        let pool = test_pool();
        test_node(&pool, "eu-1", Some("eu"), ConnectionState::Connected, 0.2).await;
        test_node(&pool, "eu-2", Some("eu"), ConnectionState::Connected, 0.1).await;
        test_node(&pool, "us-1", Some("us"), ConnectionState::Connected, 0.0).await;

        let picked = pool.select_node(Some("eu")).await.unwrap();
        assert_eq!(picked.key(), "eu-2:2333");
    }

    #[tokio::test]
    async fn falls_back_to_any_region_when_none_match() {
        let pool = test_pool();
        test_node(&pool, "us-1", Some("us"), ConnectionState::Connected, 0.3).await;
        test_node(&pool, "us-2", Some("us"), ConnectionState::Connected, 0.1).await;

        let picked = pool.select_node(Some("eu")).await.unwrap();
        assert_eq!(picked.key(), "us-2:2333");
    }

    #[tokio::test]
    async fn skips_disconnected_and_draining_nodes() {
        let pool = test_pool();
        test_node(&pool, "a", None, ConnectionState::Disconnected, 0.0).await;
        test_node(&pool, "b", None, ConnectionState::Draining, 0.0).await;
        assert!(pool.select_node(None).await.is_none());

        test_node(&pool, "c", None, ConnectionState::Connected, 0.9).await;
        let picked = pool.select_node(None).await.unwrap();
        assert_eq!(picked.key(), "c:2333");
    }

    #[tokio::test]
    async fn fresh_node_without_stats_ranks_as_unloaded() {
        let pool = test_pool();
        test_node(&pool, "busy", None, ConnectionState::Connected, 0.8).await;
        let fresh = NodeConnection::new(options("fresh", None));
        fresh.set_state(ConnectionState::Connected).await;
        pool.insert_for_test(fresh).await;

        let picked = pool.select_node(None).await.unwrap();
        assert_eq!(picked.key(), "fresh:2333");
    }

    #[tokio::test]
    async fn duplicate_host_key_keeps_existing_node() {
        let pool = test_pool();
        let first = pool.add_node(options("voice-1", None)).await;
        let second = pool.add_node(options("voice-1", None)).await;
        assert_eq!(first.key(), second.key());
        assert_eq!(pool.nodes().await.len(), 1);
        pool.remove_node("voice-1:2333").await;
    }

    #[tokio::test]
    async fn remove_unknown_node_is_false() {
        let pool = test_pool();
        assert!(!pool.remove_node("nope:2333").await);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_runs_first_job_immediately_and_paces_the_rest() {
        let queue = FailoverQueue::new(Duration::from_millis(250), 1);
        let ran = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..3usize {
            let ran = Arc::clone(&ran);
            let counter = Arc::clone(&counter);
            queue
                .submit(Box::pin(async move {
                    ran.lock().await.push(i);
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }

        // The first job ran inline during submit.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.backlog().await, 2);

        // Let the spawned drain task register its sleep before advancing.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*ran.lock().await, vec![0, 1, 2]);
        assert_eq!(queue.backlog().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_respects_window_limit() {
        let queue = FailoverQueue::new(Duration::from_millis(100), 2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5usize {
            let counter = Arc::clone(&counter);
            queue
                .submit(Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Let the spawned drain task register its sleep before advancing.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
