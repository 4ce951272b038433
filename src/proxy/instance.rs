//! Proxy instances
//!
//! One instance fronts one modem interface. It listens on its own port (the port
//! number is the instance ID), relays client sessions from the modem's address, and
//! runs two workers of its own: the rotation worker, which walks the
//! disconnect/reconnect cycle, and the health worker, which checks that the address
//! the outside world sees has actually changed.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{Result, RotaError};
use crate::models::{InstanceSnapshot, IpHistory, ProbeOutcome};
use crate::modem::{InterfaceHandle, ModemProvider};
use crate::proxy::probe::ExternalIpProbe;
use crate::proxy::rotation::{Debounce, RotationPhase, RotationQueue, RotationRequest};
use crate::proxy::session::{self, SessionRegistry};
use crate::services::IpLog;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Collaborators shared by every instance of a pool
#[derive(Clone)]
pub struct InstanceContext {
    pub config: Arc<Config>,
    pub provider: Arc<dyn ModemProvider>,
    pub probe: Arc<dyn ExternalIpProbe>,
    pub ip_log: Arc<IpLog>,
    pub queue: Arc<RotationQueue>,
    pub shutdown: watch::Receiver<bool>,
}

struct InstanceState {
    interface: Option<InterfaceHandle>,
    address: Option<Ipv4Addr>,
    phase: RotationPhase,
    debounce: Debounce,
    history: IpHistory,
}

/// A proxy listener bound to one modem interface
pub struct ProxyInstance {
    id: u32,
    ctx: InstanceContext,
    state: RwLock<InstanceState>,
    paused: watch::Sender<bool>,
    /// Held for the whole of a rotation cycle, and by bind/unbind
    transition: tokio::sync::Mutex<()>,
    sessions: Arc<SessionRegistry>,
    rotation_tx: mpsc::Sender<bool>,
    rotation_rx: Mutex<Option<mpsc::Receiver<bool>>>,
    health_trigger: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyInstance {
    pub fn new(id: u32, ctx: InstanceContext) -> Arc<Self> {
        // One pending request at most; anything beyond it is coalesced.
        let (rotation_tx, rotation_rx) = mpsc::channel(1);
        let (paused, _) = watch::channel(true);

        let state = InstanceState {
            interface: None,
            address: None,
            phase: RotationPhase::Unbound,
            debounce: Debounce::new(ctx.config.rotation.debounce),
            history: IpHistory::new(ctx.config.health.history_size),
        };

        Arc::new(Self {
            id,
            ctx,
            state: RwLock::new(state),
            paused,
            transition: tokio::sync::Mutex::new(()),
            sessions: Arc::new(SessionRegistry::new()),
            rotation_tx,
            rotation_rx: Mutex::new(Some(rotation_rx)),
            health_trigger: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn interface(&self) -> Option<InterfaceHandle> {
        self.state.read().interface.clone()
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.state.read().address
    }

    pub fn phase(&self) -> RotationPhase {
        self.state.read().phase
    }

    pub fn is_idle(&self) -> bool {
        self.state.read().interface.is_none()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.read();
        InstanceSnapshot {
            id: self.id,
            interface: state.interface.clone(),
            address: state.address,
            phase: state.phase,
            paused: *self.paused.borrow(),
            sessions: self.sessions.len(),
            recent_ips: state.history.recent(),
            secs_since_rotation: state
                .debounce
                .last_accepted()
                .map(|at| Instant::now().saturating_duration_since(at).as_secs()),
        }
    }

    /// Subscriber number of the bound modem
    pub async fn subscriber_number(&self) -> Option<String> {
        let interface = self.interface()?;
        Some(self.ctx.provider.subscriber_number(&interface).await)
    }

    /// Attach a new instance to its first interface and start it
    ///
    /// The instance starts paused and asks for one rotation so the modem begins
    /// with a fresh address.
    pub async fn launch(self: &Arc<Self>, interface: InterfaceHandle) -> Result<()> {
        {
            let _transition = self.transition.lock().await;
            let mut state = self.state.write();
            state.interface = Some(interface);
            state.phase = RotationPhase::Rotating;
        }

        let started = self.start();
        self.request_rotation(false);
        started
    }

    /// Spawn the workers and the listener
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_workers();

        let port = u16::try_from(self.id)
            .map_err(|_| RotaError::InvalidConfig(format!("instance ID {} is not a valid port", self.id)))?;
        let addr = format!("{}:{}", self.ctx.config.proxy.host, port);
        let std_listener = std::net::TcpListener::bind(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        info!(instance_id = self.id, %addr, "Proxy instance listening");

        let instance = Arc::clone(self);
        let handle = tokio::spawn(async move { instance.accept_loop(listener).await });
        self.tasks.lock().push(handle);
        Ok(())
    }

    pub(crate) fn spawn_workers(self: &Arc<Self>) {
        let Some(rotation_rx) = self.rotation_rx.lock().take() else {
            return;
        };

        let rotation = {
            let instance = Arc::clone(self);
            tokio::spawn(async move { instance.rotation_worker(rotation_rx).await })
        };
        let health = {
            let instance = Arc::clone(self);
            tokio::spawn(async move { instance.health_worker().await })
        };

        self.tasks.lock().extend([rotation, health]);
    }

    /// Rebind an idle instance to a new interface
    #[instrument(skip(self), fields(instance_id = self.id))]
    pub async fn bind(&self, interface: InterfaceHandle) {
        let _transition = self.transition.lock().await;

        let address = match self.ctx.provider.local_ipv4(&interface).await {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, "Address lookup failed while binding");
                None
            }
        };

        {
            let mut state = self.state.write();
            state.interface = Some(interface.clone());
            state.address = address;
            state.phase = if address.is_some() {
                RotationPhase::Active
            } else {
                RotationPhase::Rotating
            };
        }

        match address {
            Some(address) => {
                info!(%interface, %address, "Instance rebound");
                self.paused.send_replace(false);
                self.health_trigger.notify_one();
            }
            None => {
                info!(%interface, "Instance rebound without an address, rotating");
                self.request_rotation(true);
            }
        }
    }

    /// Detach from the interface, leaving the instance idle
    #[instrument(skip(self), fields(instance_id = self.id))]
    pub async fn unbind(&self) -> Option<InterfaceHandle> {
        let _transition = self.transition.lock().await;

        let previous = {
            let mut state = self.state.write();
            state.address = None;
            state.phase = RotationPhase::Unbound;
            state.interface.take()
        };
        self.paused.send_replace(true);
        let closed = self.sessions.close_all();

        if let Some(interface) = &previous {
            info!(%interface, closed, "Instance unbound");
        }
        previous
    }

    /// Hand a rotation request to the rotation worker
    ///
    /// Returns false when the request is debounced, already pending, or the
    /// instance is unbound.
    pub fn request_rotation(&self, forced: bool) -> bool {
        let mut state = self.state.write();
        if state.interface.is_none() {
            debug!(instance_id = self.id, "Rotation request for unbound instance dropped");
            return false;
        }

        let now = Instant::now();
        if !state.debounce.admits(forced, now) {
            debug!(instance_id = self.id, "Rotation request debounced");
            return false;
        }

        match self.rotation_tx.try_send(forced) {
            Ok(()) => {
                state.debounce.record(now);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(instance_id = self.id, "Rotation already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Schedule a health check cycle
    pub fn trigger_health_check(&self) {
        self.health_trigger.notify_one();
    }

    /// Force-close every live session
    pub fn close_sessions(&self) -> usize {
        self.sessions.close_all()
    }

    /// Wait for the workers to finish after shutdown
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Accept clients; while paused they are accepted and closed straight away
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) if self.is_paused() => {
                            debug!(instance_id = self.id, %peer, "Instance paused, closing client");
                            drop(stream);
                        }
                        Ok((stream, peer)) => {
                            let instance = Arc::clone(&self);
                            tokio::spawn(async move { instance.serve(stream, peer).await });
                        }
                        Err(e) => {
                            error!(instance_id = self.id, "Accept error: {}", e);
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        debug!(instance_id = self.id, "Accept loop stopped");
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let Some(local) = self.address_for_accept().await else {
            debug!(instance_id = self.id, %peer, "No modem address, dropping client");
            return;
        };

        let guard = self.sessions.register();
        let queue = Arc::clone(&self.ctx.queue);
        let id = self.id;

        let result = session::run(stream, guard, Some(local), &self.ctx.config.proxy, move || {
            queue.enqueue(RotationRequest::new(id, false))
        })
        .await;

        if let Err(e) = result {
            debug!(instance_id = self.id, %peer, kind = %e.kind(), "Session failed: {}", e);
        }
    }

    async fn address_for_accept(&self) -> Option<Ipv4Addr> {
        if let Some(address) = self.address() {
            return Some(address);
        }
        let interface = self.interface()?;
        let rotation = &self.ctx.config.rotation;
        self.poll_address(
            &interface,
            rotation.accept_address_attempts,
            rotation.address_poll_interval,
        )
        .await
    }

    async fn poll_address(
        &self,
        interface: &InterfaceHandle,
        attempts: u32,
        interval: Duration,
    ) -> Option<Ipv4Addr> {
        for attempt in 1..=attempts {
            match self.ctx.provider.local_ipv4(interface).await {
                Ok(Some(address)) => return Some(address),
                Ok(None) => {}
                Err(e) => debug!(instance_id = self.id, attempt, "Address lookup failed: {}", e),
            }
            if attempt < attempts {
                sleep(interval).await;
            }
        }
        None
    }

    async fn rotation_worker(self: Arc<Self>, mut requests: mpsc::Receiver<bool>) {
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(forced) = request else { break };
                    tokio::select! {
                        _ = self.rotate(forced) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        debug!(instance_id = self.id, "Rotation worker stopped");
    }

    fn set_phase(&self, phase: RotationPhase) {
        self.state.write().phase = phase;
    }

    /// One full disconnect, reconnect and resume cycle
    #[instrument(skip(self), fields(instance_id = self.id))]
    async fn rotate(&self, forced: bool) {
        let _transition = self.transition.lock().await;
        let Some(interface) = self.interface() else {
            debug!("Instance unbound before rotation started");
            return;
        };
        let rotation = &self.ctx.config.rotation;

        // Rotating
        {
            let mut state = self.state.write();
            state.phase = RotationPhase::Rotating;
            state.address = None;
        }
        self.paused.send_replace(true);
        let closed = self.sessions.close_all();
        info!(%interface, forced, closed, "Rotating address");

        if let Err(e) = self.ctx.provider.disconnect(&interface).await {
            warn!(kind = %e.kind(), "Modem disconnect failed: {}", e);
        }
        sleep(rotation.disconnect_settle).await;

        // Reconnecting
        self.set_phase(RotationPhase::Reconnecting);
        if let Err(e) = self.ctx.provider.connect(&interface).await {
            warn!(kind = %e.kind(), "Modem connect failed: {}", e);
        }
        sleep(rotation.connect_settle).await;

        let Some(address) = self
            .poll_address(
                &interface,
                rotation.address_poll_attempts,
                rotation.address_poll_interval,
            )
            .await
        else {
            warn!(%interface, "No address after reconnect, requesting another rotation");
            self.ctx.queue.enqueue(RotationRequest::forced(self.id));
            return;
        };

        // Verifying until the health worker reports its first result
        self.sessions.close_all();
        {
            let mut state = self.state.write();
            state.address = Some(address);
            state.phase = RotationPhase::Verifying;
        }
        self.paused.send_replace(false);
        info!(%interface, %address, "Address rotated, verifying");

        self.health_trigger.notify_one();
    }

    async fn health_worker(self: Arc<Self>) {
        let mut shutdown = self.ctx.shutdown.clone();
        let mut budget = self.ctx.config.health.initial_budget;

        loop {
            tokio::select! {
                _ = self.health_trigger.notified() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            tokio::select! {
                _ = self.health_cycle(&mut budget) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        debug!(instance_id = self.id, "Health worker stopped");
    }

    /// Probe until one attempt succeeds or the budget runs out
    ///
    /// `budget` carries over between cycles: each failed attempt raises it by the
    /// configured step, any success resets it.
    #[instrument(skip(self, budget), fields(instance_id = self.id))]
    async fn health_cycle(&self, budget: &mut u32) {
        let health = &self.ctx.config.health;
        let cycle_budget = (*budget).max(1);

        for attempt in 1..=cycle_budget {
            let Some(local) = self.address() else {
                debug!("No address, skipping health check");
                return;
            };

            let result = self.ctx.probe.probe(local).await;
            self.finish_verifying();

            match result {
                Ok(external) => {
                    *budget = health.initial_budget;
                    let outcome = self.state.write().history.observe(external);
                    self.record_probe(Some(external), outcome).await;

                    if outcome == ProbeOutcome::Duplicate {
                        warn!(%external, "External address did not change, requesting rotation");
                        self.ctx.queue.enqueue(RotationRequest::forced(self.id));
                    } else {
                        info!(%external, attempt, "External address verified");
                    }
                    return;
                }
                Err(e) => {
                    *budget = budget.saturating_add(health.budget_step);
                    self.record_probe(None, ProbeOutcome::Failed).await;
                    debug!(attempt, cycle_budget, "Health probe failed: {}", e);
                    if attempt < cycle_budget {
                        sleep(health.attempt_pause).await;
                    }
                }
            }
        }

        warn!(cycle_budget, "Health probes exhausted, requesting rotation");
        self.ctx.queue.enqueue(RotationRequest::forced(self.id));
    }

    /// Leave `Verifying` once a probe result is in
    fn finish_verifying(&self) {
        let mut state = self.state.write();
        if state.phase == RotationPhase::Verifying {
            state.phase = RotationPhase::Active;
        }
    }

    async fn record_probe(&self, ip: Option<Ipv4Addr>, outcome: ProbeOutcome) {
        if let Err(e) = self.ctx.ip_log.append(self.id, ip, outcome).await {
            warn!(instance_id = self.id, path = %self.ctx.ip_log.path().display(), "Failed to append IP log: {}", e);
        }
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
