//! Proxy pool
//!
//! Owns every proxy instance for the life of the process. Instances are bound to
//! modem interfaces as they appear and unbound when they vanish, but never removed,
//! so instance IDs stay stable for control-plane callers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RotaError};
use crate::models::InstanceSnapshot;
use crate::modem::InterfaceHandle;
use crate::proxy::instance::{shutdown_requested, InstanceContext, ProxyInstance};
use crate::proxy::rotation::{RotationQueue, RotationRequest};

/// What one `refresh` changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub unbound: Vec<u32>,
    pub rebound: Vec<u32>,
    pub created: Vec<u32>,
}

impl RefreshSummary {
    pub fn is_empty(&self) -> bool {
        self.unbound.is_empty() && self.rebound.is_empty() && self.created.is_empty()
    }
}

/// The set of proxy instances and their rotation queue
pub struct ProxyPool {
    ctx: InstanceContext,
    instances: Mutex<BTreeMap<u32, Arc<ProxyInstance>>>,
    next_id: AtomicU32,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ProxyPool {
    pub fn new(ctx: InstanceContext) -> Self {
        let first_id = ctx.config.first_instance_id();
        Self {
            ctx,
            instances: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(first_id),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &Arc<RotationQueue> {
        &self.ctx.queue
    }

    pub fn get(&self, id: u32) -> Option<Arc<ProxyInstance>> {
        self.instances.lock().get(&id).cloned()
    }

    /// Every instance ID, bound or idle, ascending
    pub fn ids(&self) -> Vec<u32> {
        self.instances.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instance_list().iter().map(|i| i.snapshot()).collect()
    }

    /// Queue a rotation; unknown IDs are discarded by the queue worker
    pub fn enqueue_rotation(&self, id: u32, forced: bool) {
        self.ctx.queue.enqueue(RotationRequest::new(id, forced));
    }

    /// Subscriber number of an instance's modem
    pub async fn subscriber_number(&self, id: u32) -> Result<String> {
        let instance = self.get(id).ok_or(RotaError::InstanceNotFound { id })?;
        instance
            .subscriber_number()
            .await
            .ok_or(RotaError::InstanceUnbound { id })
    }

    fn instance_list(&self) -> Vec<Arc<ProxyInstance>> {
        self.instances.lock().values().cloned().collect()
    }

    /// Reconcile instances with the interfaces the modem provider reports
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let _refresh = self.refresh_lock.lock().await;
        let present = self.ctx.provider.list_interfaces().await?;
        let mut summary = RefreshSummary::default();

        let mut bound = BTreeSet::new();
        for instance in self.instance_list() {
            let Some(interface) = instance.interface() else {
                continue;
            };
            if present.contains(&interface) {
                bound.insert(interface);
            } else {
                instance.unbind().await;
                summary.unbound.push(instance.id());
            }
        }

        for interface in present.into_iter().filter(|i| !bound.contains(i)) {
            match self.pick_idle() {
                Some(instance) => {
                    instance.bind(interface).await;
                    summary.rebound.push(instance.id());
                }
                None => {
                    let id = self.create(interface).await;
                    summary.created.push(id);
                }
            }
        }

        if !summary.is_empty() {
            info!(
                unbound = ?summary.unbound,
                rebound = ?summary.rebound,
                created = ?summary.created,
                "Interfaces changed"
            );
        }
        Ok(summary)
    }

    fn pick_idle(&self) -> Option<Arc<ProxyInstance>> {
        let idle: Vec<_> = self
            .instance_list()
            .into_iter()
            .filter(|i| i.is_idle())
            .collect();
        idle.choose(&mut rand::thread_rng()).cloned()
    }

    async fn create(&self, interface: InterfaceHandle) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let instance = ProxyInstance::new(id, self.ctx.clone());
        self.instances.lock().insert(id, Arc::clone(&instance));

        info!(instance_id = id, %interface, "Creating proxy instance");
        if let Err(e) = instance.launch(interface).await {
            warn!(instance_id = id, kind = %e.kind(), "Proxy instance failed to start listening: {}", e);
        }
        id
    }

    /// Dispatch every queued rotation request in FIFO order
    pub fn dispatch_pending(&self) -> usize {
        let requests = self.ctx.queue.drain();
        let count = requests.len();

        for request in requests {
            match self.get(request.id) {
                Some(instance) => {
                    if instance.request_rotation(request.forced) {
                        debug!(instance_id = request.id, forced = request.forced, "Rotation accepted");
                    }
                }
                None => debug!(instance_id = request.id, "Rotation request for unknown instance discarded"),
            }
        }
        count
    }

    /// Drain the rotation queue at the configured interval until shutdown
    pub async fn run_queue_worker(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.ctx.config.pool.queue_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_pending();
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Rotation queue worker shutting down");
                    break;
                }
            }
        }
    }

    /// Force-close every session and wait for instance workers to stop
    pub async fn shutdown(&self) {
        let instances = self.instance_list();
        let closed: usize = instances.iter().map(|i| i.close_sessions()).sum();
        info!(instances = instances.len(), closed, "Closing proxy sessions");

        for instance in instances {
            instance.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use crate::config::Config;
    use crate::modem::StaticModemProvider;
    use crate::proxy::instance::tests::{test_context, ScriptedProbe};
    use crate::proxy::rotation::RotationPhase;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn pool_with(
        control_port: u16,
        provider: Arc<StaticModemProvider>,
    ) -> (Arc<ProxyPool>, watch::Sender<bool>) {
        let mut config = Config::default();
        config.control.port = control_port;
        config.proxy.host = "127.0.0.1".to_string();
        let probe = Arc::new(ScriptedProbe::default());
        let (ctx, shutdown) = test_context(config, provider, probe);
        (Arc::new(ProxyPool::new(ctx)), shutdown)
    }

    fn bound_to(pool: &ProxyPool) -> Vec<(u32, Option<InterfaceHandle>)> {
        pool.snapshots()
            .into_iter()
            .map(|s| (s.id, s.interface))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_creates_sequential_instances() {
        let provider = Arc::new(StaticModemProvider::new());
        provider.insert("wwan0", Some(addr(1)), None);
        provider.insert("wwan1", Some(addr(2)), None);
        let (pool, _shutdown) = pool_with(46100, provider);

        let summary = pool.refresh().await.unwrap();
        assert_eq!(summary.created, vec![46101, 46102]);
        assert_eq!(pool.ids(), vec![46101, 46102]);

        // Nothing changed, nothing to do.
        assert!(pool.refresh().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_instance_rotates_once_at_start() {
        let provider = Arc::new(StaticModemProvider::new());
        provider.insert("wwan0", Some(addr(1)), None);
        provider.script_addresses("wwan0", &[addr(9)]);
        let (pool, _shutdown) = pool_with(46200, provider.clone());

        pool.refresh().await.unwrap();
        let instance = pool.get(46201).unwrap();
        assert!(instance.is_paused());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(provider.disconnect_count(), 1);
        assert_eq!(instance.phase(), RotationPhase::Active);
        assert_eq!(instance.address(), Some(addr(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_interface_rebinds_idle_instance() {
        let provider = Arc::new(StaticModemProvider::new());
        provider.insert("cdc-wdm0", Some(addr(1)), None);
        let (pool, _shutdown) = pool_with(1000, provider.clone());

        pool.refresh().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        let instance = pool.get(1001).unwrap();
        assert_eq!(instance.phase(), RotationPhase::Active);
        let session = instance.sessions().register();

        provider.remove("cdc-wdm0");
        let summary = pool.refresh().await.unwrap();
        assert_eq!(summary.unbound, vec![1001]);
        assert!(instance.is_idle());
        assert_eq!(instance.address(), None);
        assert!(*session.close_signal().borrow());

        provider.insert("cdc-wdm7", Some(addr(7)), None);
        let summary = pool.refresh().await.unwrap();
        assert_eq!(summary.rebound, vec![1001]);
        assert!(summary.created.is_empty());
        assert_eq!(pool.ids(), vec![1001]);
        assert_eq!(instance.interface(), Some(InterfaceHandle::from("cdc-wdm7")));
        assert_eq!(instance.address(), Some(addr(7)));
        assert!(!instance.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_instance_per_interface() {
        let provider = Arc::new(StaticModemProvider::new());
        for name in ["a", "b", "c"] {
            provider.insert(name, Some(addr(1)), None);
        }
        let (pool, _shutdown) = pool_with(46400, provider.clone());
        pool.refresh().await.unwrap();

        provider.remove("a");
        provider.remove("b");
        pool.refresh().await.unwrap();
        provider.insert("d", Some(addr(4)), None);
        provider.insert("e", Some(addr(5)), None);
        pool.refresh().await.unwrap();

        let mut interfaces: Vec<_> = bound_to(&pool)
            .into_iter()
            .filter_map(|(_, interface)| interface)
            .collect();
        interfaces.sort();
        let before = interfaces.len();
        interfaces.dedup();
        assert_eq!(before, interfaces.len());
        assert_eq!(before, 3);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_worker_dispatches_and_discards_unknown() {
        let provider = Arc::new(StaticModemProvider::new());
        provider.insert("wwan0", Some(addr(1)), None);
        let (pool, shutdown) = pool_with(46500, provider.clone());
        pool.refresh().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(provider.disconnect_count(), 1);

        let worker = {
            let pool = Arc::clone(&pool);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { pool.run_queue_worker(rx).await })
        };

        pool.enqueue_rotation(99999, false);
        pool.enqueue_rotation(46501, true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.queue().is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(provider.disconnect_count(), 2);

        shutdown.send_replace(true);
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_number_lookup() {
        let provider = Arc::new(StaticModemProvider::new());
        provider.insert("wwan0", Some(addr(1)), Some("+15550100".to_string()));
        let (pool, _shutdown) = pool_with(46600, provider.clone());
        pool.refresh().await.unwrap();

        assert_eq!(pool.subscriber_number(46601).await.unwrap(), "+15550100");
        assert!(matches!(
            pool.subscriber_number(1).await,
            Err(RotaError::InstanceNotFound { id: 1 })
        ));

        provider.remove("wwan0");
        pool.refresh().await.unwrap();
        assert!(matches!(
            pool.subscriber_number(46601).await,
            Err(RotaError::InstanceUnbound { id: 46601 })
        ));
    }
}
