//! Converges a live interface onto a desired configuration.
//!
//! A reconcile validates the desired config, takes the per-interface lock,
//! loads file-referenced keys, reads the live state, diffs, and applies the
//! diff through the driver: device changes first, then peer removals, then
//! peer additions and updates in desired order. Hostname endpoints resolve
//! in the background while that happens and are set once known.

mod plan;
mod result;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use result::{DeviceChange, PeerAction, PeerOutcome, ReconcileResult};

use self::plan::{Plan, PeerStep, StepKind};
use crate::config::{InterfaceConfig, validate_interface_name};
use crate::driver::{DriverOperation, InterfaceDriver};
use crate::error::{DriverError, KeyStoreError, PeerError, ReconcileError, UnresolvedEndpoint};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::keystore::{DEFAULT_KEY_ROOT, FsKeyStore, KeyStore};
use crate::resolver::{EndpointResolver, HostLookup, Resolution, ResolverConfig, SystemLookup};
use crate::state::{DevicePeer, LiveState};
use crate::types::KeySource;

/// Settings for a [`Reconciler`] built with [`Reconciler::with_config`].
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Directory key file references are resolved against.
    pub key_root: PathBuf,
    /// Endpoint resolution bounds.
    pub resolver: ResolverConfig,
    /// Deadline applied when the caller gives none.
    pub timeout: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            key_root: PathBuf::from(DEFAULT_KEY_ROOT),
            resolver: ResolverConfig::default(),
            timeout: None,
        }
    }
}

impl ReconcilerConfig {
    /// Sets the key root.
    #[must_use]
    pub fn with_key_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.key_root = root.into();
        self
    }

    /// Sets the resolver bounds.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the default deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-call controls for [`Reconciler::reconcile_with`].
#[derive(Clone, Debug, Default)]
pub struct ReconcileOptions {
    /// No new driver operation starts after this instant.
    pub deadline: Option<Instant>,
    /// Cancelling stops the reconcile the same way the deadline does.
    pub cancel: CancellationToken,
}

impl ReconcileOptions {
    /// Options with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Uses `cancel` as the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Applies desired configurations through an [`InterfaceDriver`].
///
/// Safe to share: reconciles for different interfaces run in parallel, a
/// second reconcile for an interface already in flight fails with
/// [`ReconcileError::Busy`].
pub struct Reconciler<D, K = FsKeyStore, L = SystemLookup> {
    driver: Arc<D>,
    keys: Arc<K>,
    resolver: EndpointResolver<L>,
    timeout: Option<Duration>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl<D, K, L> Clone for Reconciler<D, K, L> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            keys: Arc::clone(&self.keys),
            resolver: self.resolver.clone(),
            timeout: self.timeout,
            active: Arc::clone(&self.active),
        }
    }
}

impl<D: InterfaceDriver> Reconciler<D> {
    /// Creates a reconciler with default settings.
    #[must_use]
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, ReconcilerConfig::default())
    }

    /// Creates a reconciler using the file key store and system resolver.
    #[must_use]
    pub fn with_config(driver: D, config: ReconcilerConfig) -> Self {
        let keys = FsKeyStore::new(config.key_root);
        let resolver = EndpointResolver::new(SystemLookup, config.resolver);
        Self::from_parts(driver, keys, resolver, config.timeout)
    }
}

impl<D, K, L> Reconciler<D, K, L>
where
    D: InterfaceDriver,
    K: KeyStore,
    L: HostLookup,
{
    /// Creates a reconciler from its collaborators.
    #[must_use]
    pub fn from_parts(
        driver: D,
        keys: K,
        resolver: EndpointResolver<L>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            driver: Arc::new(driver),
            keys: Arc::new(keys),
            resolver,
            timeout,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Reconciles with the default deadline.
    ///
    /// # Errors
    ///
    /// See [`reconcile_with`](Self::reconcile_with).
    pub async fn reconcile(
        &self,
        desired: &InterfaceConfig,
    ) -> Result<ReconcileResult, ReconcileError> {
        self.reconcile_with(desired, ReconcileOptions::default()).await
    }

    /// Brings the interface named by `desired` into the desired state.
    ///
    /// Per-peer failures are reported in the result. Running past the
    /// deadline or being cancelled returns an incomplete result.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Validation`] if `desired` is invalid.
    /// - [`ReconcileError::Busy`] if the interface is already being
    ///   reconciled.
    /// - [`ReconcileError::KeyStore`] if the private key file cannot be
    ///   loaded.
    /// - [`ReconcileError::Device`] if reading state or a device-level
    ///   change fails; the error carries the partial result.
    pub async fn reconcile_with(
        &self,
        desired: &InterfaceConfig,
        options: ReconcileOptions,
    ) -> Result<ReconcileResult, ReconcileError> {
        desired.validate()?;
        let _guard = self.lock(&desired.name)?;
        let name = desired.name.as_str();
        info!(interface = name, peers = desired.peers.len(), "reconciling interface");

        let private_key = self.load_private_key(desired).await?;
        let preshared = self.load_preshared_keys(desired).await;

        let run = Run {
            driver: &*self.driver,
            name,
            deadline: options
                .deadline
                .or_else(|| self.timeout.map(|t| Instant::now() + t)),
            cancel: &options.cancel,
        };
        let mut result = ReconcileResult::new(name);

        if run.stopped() {
            result.skip_all(desired.peers.iter().map(|p| p.public_key));
            return Ok(finish(result));
        }

        let live = match run
            .call(DriverOperation::ReadState, None, move || run.driver.read_state(name))
            .await
        {
            Ok(live) => live,
            Err(error) => return Err(device_failure(result, error)),
        };

        let plan = Plan::build(desired, private_key.as_ref(), preshared, &live);
        if plan.is_empty() {
            debug!(interface = name, "interface already matches");
        }

        let mut resolutions = JoinSet::new();
        let mut pending = HashSet::new();
        for (index, step) in plan.peers.iter().enumerate() {
            if let (Some((host, port)), Some(_)) = (&step.resolve, step.device_peer()) {
                self.resolver
                    .spawn(&mut resolutions, index, host.clone(), *port);
                pending.insert(index);
            }
        }
        let resolve_until = Instant::now() + self.resolver.config().timeout;

        for change in &plan.device {
            if run.stopped() {
                result.skip_all(
                    plan.removals
                        .iter()
                        .copied()
                        .chain(plan.peers.iter().map(|s| s.public_key)),
                );
                return Ok(finish(result));
            }
            if let Err(error) = run.apply_device(change, private_key.as_ref()).await {
                return Err(device_failure(result, error));
            }
            debug!(interface = name, change = ?change, "applied device change");
            result.created |= matches!(change, DeviceChange::Create);
            result.device_changes.push(change.clone());
        }

        for public_key in &plan.removals {
            let outcome = if run.stopped() {
                PeerOutcome::skipped(*public_key)
            } else {
                run.remove_peer(public_key).await
            };
            result.record(outcome);
        }

        let mut slots = HashMap::with_capacity(plan.peers.len());
        for (index, step) in plan.peers.iter().enumerate() {
            let outcome = if run.stopped() {
                PeerOutcome::skipped(step.public_key)
            } else {
                run.apply_step(step).await
            };
            slots.insert(index, result.record(outcome));
        }

        run.settle_endpoints(
            &plan,
            &mut resolutions,
            pending,
            resolve_until,
            &slots,
            &mut result,
        )
        .await;

        Ok(finish(result))
    }

    /// Deletes the interface. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Validation`] for a malformed name.
    /// - [`ReconcileError::Busy`] if the interface is being reconciled.
    /// - [`ReconcileError::Device`] if the driver fails.
    pub async fn remove(&self, name: &str) -> Result<bool, ReconcileError> {
        validate_interface_name(name)?;
        let _guard = self.lock(name)?;
        let cancel = CancellationToken::new();
        let run = Run {
            driver: &*self.driver,
            name,
            deadline: None,
            cancel: &cancel,
        };

        let exists = run
            .call(DriverOperation::DeviceExists, None, move || run.driver.device_exists(name))
            .await
            .map_err(|e| device_failure(ReconcileResult::new(name), e))?;
        if !exists {
            debug!(interface = name, "nothing to remove");
            return Ok(false);
        }

        run.call(DriverOperation::RemoveDevice, None, move || run.driver.remove_device(name))
            .await
            .map_err(|e| device_failure(ReconcileResult::new(name), e))?;
        info!(interface = name, "removed interface");
        Ok(true)
    }

    /// Reads the live state of `name`, retrying once.
    ///
    /// # Errors
    ///
    /// Returns the driver error if both reads fail.
    pub async fn state(&self, name: &str) -> Result<LiveState, DriverError> {
        let cancel = CancellationToken::new();
        let run = Run {
            driver: &*self.driver,
            name,
            deadline: None,
            cancel: &cancel,
        };
        run.call(DriverOperation::ReadState, None, move || run.driver.read_state(name))
            .await
    }

    fn lock(&self, name: &str) -> Result<InterfaceGuard, ReconcileError> {
        let mut active = self.active.lock();
        if !active.insert(name.to_string()) {
            debug!(interface = name, "reconcile already in flight");
            return Err(ReconcileError::Busy {
                interface: name.to_string(),
            });
        }
        Ok(InterfaceGuard {
            name: name.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    async fn load_private_key(
        &self,
        desired: &InterfaceConfig,
    ) -> Result<Option<PrivateKey>, KeyStoreError> {
        match &desired.private_key {
            KeySource::Inline(key) => Ok(Some(key.clone())),
            KeySource::File(path) => {
                let bytes = self.keys.load(path).await.inspect_err(|e| {
                    warn!(interface = %desired.name, error = %e, "private key unavailable");
                })?;
                Ok(Some(PrivateKey::from_bytes_array(bytes)))
            }
            KeySource::Absent => Ok(None),
        }
    }

    async fn load_preshared_keys(
        &self,
        desired: &InterfaceConfig,
    ) -> Vec<Result<Option<PresharedKey>, KeyStoreError>> {
        let mut keys = Vec::with_capacity(desired.peers.len());
        for peer in &desired.peers {
            let key = match &peer.preshared_key {
                KeySource::Inline(key) => Ok(Some(key.clone())),
                KeySource::File(path) => self
                    .keys
                    .load(path)
                    .await
                    .map(|bytes| Some(PresharedKey::from_bytes_array(bytes)))
                    .inspect_err(|e| {
                        warn!(
                            interface = %desired.name,
                            peer = %peer.public_key.short(),
                            error = %e,
                            "preshared key unavailable"
                        );
                    }),
                KeySource::Absent => Ok(None),
            };
            keys.push(key);
        }
        keys
    }
}

/// Releases the interface name when dropped, including on cancellation.
struct InterfaceGuard {
    name: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InterfaceGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.name);
    }
}

/// State shared by the steps of one reconcile.
struct Run<'a, D> {
    driver: &'a D,
    name: &'a str,
    deadline: Option<Instant>,
    cancel: &'a CancellationToken,
}

impl<D> Clone for Run<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Run<'_, D> {}

impl<D: InterfaceDriver> Run<'_, D> {
    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Runs a driver call, retrying it once on failure unless the run has
    /// been stopped in the meantime.
    async fn call<T, F, Fut>(
        &self,
        operation: DriverOperation,
        peer: Option<&PublicKey>,
        mut f: F,
    ) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let peer = peer.map(PublicKey::short);
        match f().await {
            Ok(value) => Ok(value),
            Err(first) if self.stopped() => {
                warn!(
                    interface = self.name,
                    %operation,
                    peer = peer.as_deref().unwrap_or("-"),
                    error = %first,
                    "driver call failed after the run stopped, not retrying"
                );
                Err(first)
            }
            Err(first) => {
                warn!(
                    interface = self.name,
                    %operation,
                    peer = peer.as_deref().unwrap_or("-"),
                    error = %first,
                    "driver call failed, retrying"
                );
                f().await.inspect_err(|error| {
                    warn!(
                        interface = self.name,
                        %operation,
                        peer = peer.as_deref().unwrap_or("-"),
                        %error,
                        "driver call failed again"
                    );
                })
            }
        }
    }

    async fn apply_device(
        &self,
        change: &DeviceChange,
        private_key: Option<&PrivateKey>,
    ) -> Result<(), DriverError> {
        let (driver, name) = (self.driver, self.name);
        let op = change.operation();
        match change {
            DeviceChange::Create => self.call(op, None, move || driver.create_device(name)).await,
            DeviceChange::PrivateKey => match private_key {
                Some(key) => {
                    self.call(op, None, move || driver.set_private_key(name, key))
                        .await
                }
                None => Ok(()),
            },
            DeviceChange::ListenPort(port) => {
                let port = *port;
                self.call(op, None, move || driver.set_listen_port(name, port))
                    .await
            }
            DeviceChange::Fwmark(mark) => {
                let mark = *mark;
                self.call(op, None, move || driver.set_fwmark(name, mark)).await
            }
            DeviceChange::Mtu(mtu) => {
                let mtu = *mtu;
                self.call(op, None, move || driver.set_mtu(name, mtu)).await
            }
            DeviceChange::Addresses(addresses) => {
                self.call(op, None, move || driver.set_addresses(name, addresses))
                    .await
            }
        }
    }

    async fn remove_peer(&self, public_key: &PublicKey) -> PeerOutcome {
        let (driver, name) = (self.driver, self.name);
        match self
            .call(DriverOperation::RemovePeer, Some(public_key), move || {
                driver.remove_peer(name, public_key)
            })
            .await
        {
            Ok(()) => {
                debug!(interface = name, peer = %public_key.short(), "removed peer");
                PeerOutcome::new(*public_key, PeerAction::Removed)
            }
            Err(error) => PeerOutcome::failed(*public_key, error.into()),
        }
    }

    async fn apply_step(&self, step: &PeerStep) -> PeerOutcome {
        let (driver, name) = (self.driver, self.name);
        let public_key = step.public_key;

        let applied = match &step.kind {
            StepKind::Blocked(error) => {
                return PeerOutcome::failed(public_key, PeerError::KeyStore(error.clone()));
            }
            StepKind::Unchanged(_) => return PeerOutcome::new(public_key, PeerAction::Unchanged),
            StepKind::Add(peer) => self
                .call(DriverOperation::AddPeer, Some(&public_key), move || {
                    driver.add_peer(name, peer)
                })
                .await
                .map(|()| (PeerAction::Added, peer.endpoint)),
            StepKind::Update(peer) => self
                .update_peer(peer, step.live_endpoint)
                .await
                .map(|action| (action, peer.endpoint)),
        };

        match applied {
            Ok((action, endpoint)) => {
                debug!(interface = name, peer = %public_key.short(), ?action, "applied peer");
                PeerOutcome {
                    endpoint,
                    ..PeerOutcome::new(public_key, action)
                }
            }
            Err(error) => PeerOutcome::failed(public_key, error.into()),
        }
    }

    /// Updates in place, or removes and re-adds when the driver cannot.
    ///
    /// The re-added peer keeps `live_endpoint` unless a new one is given.
    async fn update_peer(
        &self,
        peer: &DevicePeer,
        live_endpoint: Option<SocketAddr>,
    ) -> Result<PeerAction, DriverError> {
        let (driver, name) = (self.driver, self.name);
        let public_key = &peer.public_key;

        if driver.supports_peer_update() {
            return self
                .call(DriverOperation::UpdatePeer, Some(public_key), move || {
                    driver.update_peer(name, peer)
                })
                .await
                .map(|()| PeerAction::Updated);
        }

        let replacement = &DevicePeer {
            endpoint: peer.endpoint.or(live_endpoint),
            ..peer.clone()
        };
        self.call(DriverOperation::RemovePeer, Some(public_key), move || {
            driver.remove_peer(name, public_key)
        })
        .await?;
        self.call(DriverOperation::AddPeer, Some(public_key), move || {
            driver.add_peer(name, replacement)
        })
        .await
        .map(|()| PeerAction::Replaced)
    }

    /// Collects endpoint resolutions and sets the endpoints that resolved.
    async fn settle_endpoints(
        &self,
        plan: &Plan,
        resolutions: &mut JoinSet<Resolution<usize>>,
        mut pending: HashSet<usize>,
        resolve_until: Instant,
        slots: &HashMap<usize, usize>,
        result: &mut ReconcileResult,
    ) {
        let wait_until = self
            .deadline
            .map_or(resolve_until, |deadline| deadline.min(resolve_until));

        while !pending.is_empty() {
            let joined = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                joined = tokio::time::timeout_at(wait_until, resolutions.join_next()) => joined,
            };
            let (index, resolution) = match joined {
                Err(_) | Ok(None) => break,
                Ok(Some(Err(error))) => {
                    warn!(interface = self.name, %error, "endpoint resolution task failed");
                    continue;
                }
                Ok(Some(Ok(done))) => done,
            };
            pending.remove(&index);

            let (Some(step), Some(&slot)) = (plan.peers.get(index), slots.get(&index)) else {
                continue;
            };
            if !result.peer_outcomes[slot].action.is_installed() {
                continue;
            }
            match resolution {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    self.set_endpoint(step, &addrs, slot, result).await;
                }
                Err(unresolved) => {
                    warn!(
                        interface = self.name,
                        peer = %step.public_key.short(),
                        error = %unresolved,
                        "peer left without endpoint"
                    );
                    result.peer_outcomes[slot].error = Some(unresolved.into());
                }
            }
        }
        resolutions.abort_all();

        let stopped = self.stopped();
        for index in pending {
            let (Some(step), Some(&slot)) = (plan.peers.get(index), slots.get(&index)) else {
                continue;
            };
            let outcome = &mut result.peer_outcomes[slot];
            if !outcome.action.is_installed() {
                continue;
            }
            outcome.error = Some(if stopped {
                PeerError::Incomplete
            } else {
                let host = step.resolve.as_ref().map(|(h, _)| h.clone()).unwrap_or_default();
                warn!(interface = self.name, peer = %step.public_key.short(), %host, "endpoint resolution timed out");
                PeerError::UnresolvedEndpoint(UnresolvedEndpoint {
                    host,
                    attempts: 0,
                    reason: "resolution timed out".to_string(),
                })
            });
            result.incomplete |= stopped;
        }
    }

    async fn set_endpoint(
        &self,
        step: &PeerStep,
        addrs: &[SocketAddr],
        slot: usize,
        result: &mut ReconcileResult,
    ) {
        let Some(peer) = step.device_peer() else {
            return;
        };
        if let Some(current) = step.live_endpoint.filter(|e| addrs.contains(e)) {
            result.peer_outcomes[slot].endpoint = Some(current);
            return;
        }
        let Some(&endpoint) = addrs.first() else {
            return;
        };
        if self.stopped() {
            result.peer_outcomes[slot].error = Some(PeerError::Incomplete);
            result.incomplete = true;
            return;
        }

        let resolved = DevicePeer {
            endpoint: Some(endpoint),
            ..peer.clone()
        };
        let outcome = &mut result.peer_outcomes[slot];
        match self.update_peer(&resolved, None).await {
            Ok(action) => {
                debug!(interface = self.name, peer = %step.public_key.short(), %endpoint, "set resolved endpoint");
                if outcome.action == PeerAction::Unchanged {
                    outcome.action = action;
                }
                outcome.endpoint = Some(endpoint);
            }
            Err(error) => outcome.error = Some(error.into()),
        }
    }
}

fn device_failure(mut result: ReconcileResult, error: DriverError) -> ReconcileError {
    warn!(interface = %result.interface, %error, "device setup failed");
    result.device_error = Some(error.clone());
    ReconcileError::Device {
        interface: result.interface.clone(),
        error,
        result: Box::new(result),
    }
}

fn finish(result: ReconcileResult) -> ReconcileResult {
    info!(
        interface = %result.interface,
        created = result.created,
        operations = result.operation_count(),
        errors = result.errors().len(),
        incomplete = result.incomplete,
        "reconcile finished"
    );
    result
}
