use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use proven_eos::{
    Entity, EntityOwnershipError, EntityOwnershipService, EntityOwnershipStateChange,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::{CloseFuture, CloseSignal};
use crate::service_info::{ServiceInfo, ServiceState, StopFuture};
use crate::{BoxError, Error, ServiceGroupIdentifier, ServiceRegistration};

/// Local view of one of the group's two entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntityState {
    /// No candidacy.
    Unregistered,
    /// Candidacy registered, no ownership notification yet.
    Registered,
    /// Owned by another node, or by nobody.
    Unowned,
    /// Owned by this node.
    Owned,
    /// Owned by this node, but the cluster cannot currently confirm it.
    OwnedJeopardy,
}

impl EntityState {
    const fn from_change(change: EntityOwnershipStateChange, in_jeopardy: bool) -> Self {
        match (change.is_owner(), in_jeopardy) {
            (true, false) => Self::Owned,
            (true, true) => Self::OwnedJeopardy,
            (false, _) => Self::Unowned,
        }
    }

    const fn is_owned(self) -> bool {
        matches!(self, Self::Owned | Self::OwnedJeopardy)
    }
}

/// Bookkeeping guarded by the group's state mutex. The ownership service is never called
/// while it is held.
struct GroupState<E>
where
    E: EntityOwnershipService,
{
    members: HashSet<ServiceRegistration>,
    service_registration: Option<E::CandidateRegistration>,
    service_state: EntityState,
    cleanup_registration: Option<E::CandidateRegistration>,
    cleanup_state: EntityState,
}

/// Releases the reconciliation lock when dropped.
struct Unlock<'a>(&'a AtomicBool);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        let released = self
            .0
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !std::thread::panicking() {
            assert!(released, "reconciliation lock was not held");
        }
    }
}

/// A service group which takes part in ownership elections.
///
/// Every node hosting the group registers a candidacy for the service entity. The service
/// entity owner then registers for the cleanup entity, and only once it owns the cleanup
/// entity outright does it start the group's services. A node losing the service entity
/// keeps the cleanup entity until all of its services have stopped, which keeps any other
/// node from starting its instances early.
///
/// Every mutation marks the group dirty and then attempts to reconcile. Reconciliation runs
/// on at most one thread at a time; a thread failing to take the lock leaves the dirty mark
/// for the holder, which re-checks it after unlocking.
pub struct ActiveServiceGroup<E>
where
    E: EntityOwnershipService,
{
    identifier: ServiceGroupIdentifier,
    eos: Arc<E>,
    service_entity: Entity,
    cleanup_entity: Entity,
    runtime: Handle,
    this: Weak<Self>,

    state: Mutex<GroupState<E>>,

    // Only touched while holding the reconciliation lock.
    services: Mutex<HashMap<ServiceRegistration, ServiceInfo>>,

    dirty: AtomicBool,
    reconciling: AtomicBool,
    initializing: AtomicBool,
    initialized: AtomicBool,
    close: OnceLock<CloseSignal>,
}

impl<E> ActiveServiceGroup<E>
where
    E: EntityOwnershipService,
{
    /// Creates a group seeded with `services`. Stop completions are observed on `runtime`.
    pub fn new(
        identifier: ServiceGroupIdentifier,
        eos: Arc<E>,
        service_entity: Entity,
        cleanup_entity: Entity,
        services: Vec<ServiceRegistration>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            identifier,
            eos,
            service_entity,
            cleanup_entity,
            runtime,
            this: this.clone(),
            state: Mutex::new(GroupState {
                members: services.into_iter().collect(),
                service_registration: None,
                service_state: EntityState::Unregistered,
                cleanup_registration: None,
                cleanup_state: EntityState::Unregistered,
            }),
            services: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            reconciling: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            close: OnceLock::new(),
        })
    }

    /// The group identifier.
    #[must_use]
    pub const fn identifier(&self) -> &ServiceGroupIdentifier {
        &self.identifier
    }

    /// Registers this node's service entity candidacy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] on a second call, or
    /// [`Error::CandidateRegistration`] if the ownership service refuses the candidacy.
    pub fn initialize(&self) -> Result<(), Error> {
        if self
            .initializing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyInitialized(self.identifier.clone()));
        }

        debug!(group = %self.identifier, "Initializing service group");
        self.state.lock().service_state = EntityState::Registered;

        match self.eos.register_candidate(&self.service_entity) {
            Ok(registration) => {
                self.state.lock().service_registration = Some(registration);
                self.initialized.store(true, Ordering::SeqCst);
                debug!(group = %self.identifier, entity = %self.service_entity, "Registered service entity candidate");

                // A pass already in progress picks the registration up through the dirty mark.
                self.mark_dirty();
                if self.try_lock() {
                    self.reconcile_state();
                }
                Ok(())
            }
            Err(error) => {
                self.state.lock().service_state = EntityState::Unregistered;
                self.initializing.store(false, Ordering::SeqCst);
                Err(Error::CandidateRegistration {
                    identifier: self.identifier.clone(),
                    kind: error.kind(),
                    source: Box::new(error),
                })
            }
        }
    }

    /// Adds a service to the group.
    ///
    /// # Errors
    ///
    /// Fails if the service belongs to another group, the group is closing or not yet
    /// initialized, or the registration is already a member.
    pub fn register_service(&self, registration: ServiceRegistration) -> Result<(), Error> {
        self.verify_registration(&registration)?;
        self.check_not_closed()?;
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized(self.identifier.clone()));
        }

        debug!(group = %self.identifier, %registration, "Registering service");
        if !self.state.lock().members.insert(registration.clone()) {
            return Err(Error::DuplicateMember {
                group: self.identifier.clone(),
                registration: registration.to_string(),
            });
        }

        self.mark_dirty();
        if self.try_lock() {
            self.reconcile_state();
        } else {
            debug!(group = %self.identifier, "Service group busy, registration delayed");
        }

        Ok(())
    }

    /// Removes a service from the group.
    ///
    /// Removing the last service starts tearing the group down and returns its close future.
    ///
    /// # Errors
    ///
    /// Fails if the service belongs to another group, the group is closing, or the
    /// registration is not a member.
    pub fn unregister_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<Option<CloseFuture>, Error> {
        self.verify_registration(registration)?;
        self.check_not_closed()?;

        debug!(group = %self.identifier, %registration, "Unregistering service");
        let now_empty = {
            let mut state = self.state.lock();
            if !state.members.remove(registration) {
                return Err(Error::UnknownMember {
                    group: self.identifier.clone(),
                    registration: registration.to_string(),
                });
            }
            state.members.is_empty()
        };

        self.mark_dirty();
        if now_empty {
            debug!(group = %self.identifier, "Last service unregistered, closing group");
            return Ok(Some(self.destroy_group()));
        }

        if self.try_lock() {
            self.reconcile_state();
        } else {
            debug!(group = %self.identifier, "Service group busy, unregistration delayed");
        }

        Ok(None)
    }

    /// Stops every service and releases both entities. Idempotent.
    pub fn close_cluster_singleton_group(&self) -> CloseFuture {
        let future = self.destroy_group();
        self.state.lock().members.clear();
        self.mark_dirty();

        if self.try_lock() {
            self.reconcile_state();
        } else {
            debug!(group = %self.identifier, "Service group busy, postponing close");
        }

        future
    }

    /// Delivers an ownership change for one of the group's entities.
    pub fn ownership_changed(
        &self,
        entity: &Entity,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        {
            let mut state = self.state.lock();
            if *entity == self.service_entity {
                self.service_ownership_changed(&mut state, change, in_jeopardy);
            } else if *entity == self.cleanup_entity {
                self.cleanup_ownership_changed(&mut state, change, in_jeopardy);
            } else {
                warn!(group = %self.identifier, %entity, "Ignoring ownership change of unrecognized entity");
                return;
            }
        }

        if self.is_dirty() {
            if self.try_lock() {
                self.reconcile_state();
            } else {
                debug!(group = %self.identifier, "Service group busy, postponing ownership change");
            }
        }
    }

    fn service_ownership_changed(
        &self,
        state: &mut GroupState<E>,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        let previous = state.service_state;
        let next = EntityState::from_change(change, in_jeopardy);

        if in_jeopardy {
            warn!(group = %self.identifier, %change, "Service entity ownership is in jeopardy");
        } else if previous == EntityState::OwnedJeopardy {
            info!(group = %self.identifier, %change, "Service entity ownership ascertained");
        } else {
            debug!(group = %self.identifier, %change, "Service entity ownership changed");
        }

        state.service_state = next;
        self.mark_dirty();
    }

    fn cleanup_ownership_changed(
        &self,
        state: &mut GroupState<E>,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        let previous = state.cleanup_state;
        let next = EntityState::from_change(change, in_jeopardy);

        if in_jeopardy {
            info!(group = %self.identifier, %change, "Cleanup entity ownership is in jeopardy");
        } else if previous == EntityState::OwnedJeopardy {
            info!(group = %self.identifier, %change, "Cleanup entity ownership ascertained");
        } else if previous.is_owned() && !next.is_owned() {
            info!(group = %self.identifier, %change, "Cleanup entity ownership lost");
        } else {
            debug!(group = %self.identifier, %change, "Cleanup entity ownership changed");
        }

        state.cleanup_state = next;
        self.mark_dirty();
    }

    fn destroy_group(&self) -> CloseFuture {
        let mut created = false;
        let signal = self.close.get_or_init(|| {
            created = true;
            CloseSignal::new()
        });
        if !created {
            return signal.future();
        }

        let released = self.state.lock().service_registration.take();
        if let Some(registration) = released {
            debug!(group = %self.identifier, entity = %self.service_entity, "Unregistering service entity candidate");
            drop(registration);
        }

        self.mark_dirty();
        signal.future()
    }

    /// Runs reconciliation until nothing is left dirty. Must be called with the
    /// reconciliation lock held; returns with it released.
    fn reconcile_state(&self) {
        loop {
            {
                let _unlock = Unlock(&self.reconciling);
                if self.conditional_clean() {
                    self.try_reconcile_state();
                }
            }

            if !self.is_dirty() {
                debug!(group = %self.identifier, "Service group completely reconciled");
                return;
            }
            if !self.try_lock() {
                debug!(group = %self.identifier, "Service group is being reconciled by another thread");
                return;
            }
            debug!(group = %self.identifier, "Re-running reconciliation");
        }
    }

    fn try_reconcile_state(&self) {
        let (members, have_service) = {
            let mut state = self.state.lock();
            let have_service =
                state.service_registration.is_some() && state.service_state.is_owned();

            if have_service && state.cleanup_registration.is_none() {
                state.cleanup_state = EntityState::Registered;
                drop(state);

                self.register_cleanup();
                self.mark_dirty();
                return;
            }

            let have_cleanup = state.cleanup_registration.is_some()
                && state.cleanup_state == EntityState::Owned;
            if have_service && have_cleanup {
                (Some(state.members.clone()), true)
            } else {
                (None, have_service)
            }
        };

        if let Some(members) = members {
            self.ensure_services_starting(&members);
            return;
        }

        self.ensure_services_stopping();
        if have_service || !self.services.lock().is_empty() {
            return;
        }

        debug!(group = %self.identifier, "No running services");
        let released = self.state.lock().cleanup_registration.take();
        if let Some(registration) = released {
            debug!(group = %self.identifier, entity = %self.cleanup_entity, "Releasing cleanup entity");
            drop(registration);
        }

        let can_finish_close = matches!(
            self.state.lock().cleanup_state,
            EntityState::Unowned | EntityState::Unregistered
        );
        if can_finish_close {
            if let Some(signal) = self.close.get() {
                if signal.complete() {
                    debug!(group = %self.identifier, "Service group closed");
                }
            }
        }
    }

    fn register_cleanup(&self) {
        debug!(group = %self.identifier, entity = %self.cleanup_entity, "Registering cleanup entity candidate");

        match self.eos.register_candidate(&self.cleanup_entity) {
            Ok(registration) => self.state.lock().cleanup_registration = Some(registration),
            Err(error) => {
                error!(group = %self.identifier, %error, "Failed to register cleanup entity, giving up service ownership");
                let released = {
                    let mut state = self.state.lock();
                    state.cleanup_state = EntityState::Unregistered;
                    state.service_registration.take()
                };
                drop(released);
            }
        }
    }

    fn ensure_services_starting(&self, members: &HashSet<ServiceRegistration>) {
        debug!(group = %self.identifier, "Ensuring services are started");
        let mut services = self.services.lock();

        // Anything running which is no longer a member must stop first.
        services.retain(|registration, info| {
            members.contains(registration) || self.keep_stopping(registration, info)
        });

        for registration in members {
            if services.contains_key(registration) {
                continue;
            }

            debug!(group = %self.identifier, %registration, "Starting service");
            if let Err(error) = registration.instance().instantiate_service_instance() {
                warn!(group = %self.identifier, %registration, %error, "Service failed to start, it will be retried");
                continue;
            }

            services.insert(registration.clone(), ServiceInfo::started());
        }
    }

    fn ensure_services_stopping(&self) {
        let mut services = self.services.lock();
        if services.is_empty() {
            return;
        }

        debug!(group = %self.identifier, count = services.len(), "Ensuring services are stopped");
        services.retain(|registration, info| self.keep_stopping(registration, info));
    }

    /// Returns whether the service is still tracked.
    fn keep_stopping(&self, registration: &ServiceRegistration, info: &mut ServiceInfo) -> bool {
        match self.ensure_stopping(registration, info) {
            Some(next) => {
                *info = next;
                true
            }
            None => false,
        }
    }

    /// Advances a service towards stopped. `None` means it is gone.
    fn ensure_stopping(
        &self,
        registration: &ServiceRegistration,
        info: &ServiceInfo,
    ) -> Option<ServiceInfo> {
        match info.state() {
            ServiceState::Started => {
                debug!(group = %self.identifier, %registration, "Stopping service");
                match registration.instance().close_service_instance() {
                    Ok(future) => {
                        let future = self.watch_stop(registration, future);
                        Some(info.to_state(ServiceState::Stopping, Some(future)))
                    }
                    Err(error) => {
                        warn!(group = %self.identifier, %registration, %error, "Service failed to stop, considering it stopped");
                        None
                    }
                }
            }
            ServiceState::Stopping => {
                if info.is_stopped() {
                    debug!(group = %self.identifier, %registration, "Service has stopped");
                    None
                } else {
                    Some(info.clone())
                }
            }
        }
    }

    fn watch_stop(
        &self,
        registration: &ServiceRegistration,
        future: BoxFuture<'static, Result<(), BoxError>>,
    ) -> StopFuture {
        let identifier = self.identifier.clone();
        let service = registration.to_string();
        let stop: StopFuture = future
            .map(move |result| match result {
                Ok(()) => debug!(group = %identifier, %service, "Service stopped"),
                Err(error) => {
                    warn!(group = %identifier, %service, %error, "Service stopped with an error");
                }
            })
            .boxed()
            .shared();

        if stop.clone().now_or_never().is_some() {
            self.service_transition_completed();
        } else {
            let watcher = stop.clone();
            let this = self.this.clone();
            self.runtime.spawn(async move {
                watcher.await;
                if let Some(group) = this.upgrade() {
                    group.service_transition_completed();
                }
            });
        }

        stop
    }

    fn service_transition_completed(&self) {
        self.mark_dirty();
        if self.try_lock() {
            self.reconcile_state();
        }
    }

    fn verify_registration(&self, registration: &ServiceRegistration) -> Result<(), Error> {
        if registration.identifier() == &self.identifier {
            Ok(())
        } else {
            Err(Error::ForeignService {
                group: self.identifier.clone(),
                service: registration.identifier().clone(),
            })
        }
    }

    fn check_not_closed(&self) -> Result<(), Error> {
        if self.close.get().is_some() {
            Err(Error::GroupClosed(self.identifier.clone()))
        } else {
            Ok(())
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn conditional_clean(&self) -> bool {
        self.dirty
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn try_lock(&self) -> bool {
        self.reconciling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[cfg(test)]
    fn service_state(&self, registration: &ServiceRegistration) -> Option<ServiceState> {
        self.services.lock().get(registration).map(ServiceInfo::state)
    }
}

impl<E> Debug for ActiveServiceGroup<E>
where
    E: EntityOwnershipService,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ActiveServiceGroup")
            .field("identifier", &self.identifier)
            .field("members", &state.members.len())
            .field("service_state", &state.service_state)
            .field("cleanup_state", &state.cleanup_state)
            .field("closed", &self.close.get().is_some())
            .finish_non_exhaustive()
    }
}
