use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use proven_eos::{
    Entity, EntityOwnershipListener, EntityOwnershipService, EntityOwnershipStateChange,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::group::{ActiveServiceGroup, CloseFuture, PlaceholderServiceGroup, ServiceGroup};
use crate::{
    ClusterSingletonService, Error, ProviderConfig, ServiceGroupIdentifier, ServiceRegistration,
};

/// Creates the entity of `entity_type` backing the group `identifier`.
#[must_use]
pub fn create_entity(entity_type: &str, identifier: &ServiceGroupIdentifier) -> Entity {
    Entity::new(entity_type, identifier.value())
}

/// Recovers the group identifier from one of its entities.
#[must_use]
pub fn service_identifier_from_entity(entity: &Entity) -> &str {
    entity.name()
}

// Only held so that dropping them unregisters the listeners.
struct ListenerRegistrations<E>
where
    E: EntityOwnershipService,
{
    _service: E::ListenerRegistration,
    _cleanup: E::ListenerRegistration,
}

struct ProviderInner<E>
where
    E: EntityOwnershipService,
{
    eos: Arc<E>,
    config: ProviderConfig,
    runtime: Handle,
    groups: DashMap<ServiceGroupIdentifier, ServiceGroup<E>>,

    // Serializes group creation, replacement and removal. `None` once closed.
    listeners: Mutex<Option<ListenerRegistrations<E>>>,
}

/// Routes ownership notifications without keeping the provider alive.
struct Listener<E>(Weak<ProviderInner<E>>)
where
    E: EntityOwnershipService;

impl<E> EntityOwnershipListener for Listener<E>
where
    E: EntityOwnershipService,
{
    fn ownership_changed(
        &self,
        entity: &Entity,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        if let Some(inner) = self.0.upgrade() {
            inner.ownership_changed(entity, change, in_jeopardy);
        }
    }
}

/// Hosts cluster singleton services on top of an entity ownership service.
///
/// Services sharing a [`ServiceGroupIdentifier`] form a group which runs on whichever node
/// wins that group's entities. Unregistering a group's last service tears the group down;
/// registrations for the same identifier arriving meanwhile are held back and seed a fresh
/// group once the teardown completes.
pub struct ClusterSingletonServiceProvider<E>
where
    E: EntityOwnershipService,
{
    inner: Arc<ProviderInner<E>>,
}

impl<E> ClusterSingletonServiceProvider<E>
where
    E: EntityOwnershipService,
{
    /// Creates a provider and starts listening for ownership changes.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn new(eos: Arc<E>, config: ProviderConfig) -> Self {
        let inner = Arc::new(ProviderInner {
            eos,
            config,
            runtime: Handle::current(),
            groups: DashMap::new(),
            listeners: Mutex::new(None),
        });

        let listener: Arc<dyn EntityOwnershipListener> =
            Arc::new(Listener(Arc::downgrade(&inner)));
        let service = inner
            .eos
            .register_listener(&inner.config.service_entity_type, Arc::clone(&listener));
        let cleanup = inner
            .eos
            .register_listener(&inner.config.cleanup_entity_type, listener);
        *inner.listeners.lock() = Some(ListenerRegistrations {
            _service: service,
            _cleanup: cleanup,
        });

        info!(
            service_entity_type = %inner.config.service_entity_type,
            cleanup_entity_type = %inner.config.cleanup_entity_type,
            "Cluster singleton service provider started"
        );

        Self { inner }
    }

    /// Registers a service, creating and initializing its group if needed.
    ///
    /// Closing the returned registration withdraws the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderClosed`] after [`close`](Self::close), or the group's error
    /// if it could not be created or refused the service.
    pub fn register_cluster_singleton_service(
        &self,
        service: Arc<dyn ClusterSingletonService>,
    ) -> Result<ServiceRegistration, Error> {
        let identifier = service.identifier().clone();
        let weak = Arc::downgrade(&self.inner);
        let registration = ServiceRegistration::new(service, move |registration| {
            if let Some(inner) = weak.upgrade() {
                ProviderInner::remove_registration(&inner, registration);
            }
        });

        let listeners = self.inner.listeners.lock();
        if listeners.is_none() {
            return Err(Error::ProviderClosed);
        }

        debug!(group = %identifier, %registration, "Registering cluster singleton service");
        let existing = self
            .inner
            .groups
            .get(&identifier)
            .map(|group| group.value().clone());
        let group = match existing {
            Some(group) => group,
            None => {
                let group = self.inner.create_group(identifier.clone(), Vec::new());
                self.inner.groups.insert(identifier, group.clone());
                self.inner.initialize_or_remove_group(&group)?;
                group
            }
        };

        group.register_service(registration.clone())?;
        drop(listeners);

        Ok(registration)
    }

    /// Whether a group, active or awaiting teardown, exists for `identifier`.
    #[must_use]
    pub fn has_service_group(&self, identifier: &ServiceGroupIdentifier) -> bool {
        self.inner.groups.contains_key(identifier)
    }

    /// Stops every group and stops listening for ownership changes. Idempotent.
    pub async fn close(&self) {
        let (listeners, futures) = {
            let mut listeners = self.inner.listeners.lock();
            let Some(registrations) = listeners.take() else {
                return;
            };

            info!("Cluster singleton service provider stopping");
            let groups: Vec<ServiceGroup<E>> = self
                .inner
                .groups
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            let futures: Vec<CloseFuture> = groups
                .iter()
                .map(ServiceGroup::close_cluster_singleton_group)
                .collect();
            (registrations, futures)
        };

        debug!(groups = futures.len(), "Waiting for service groups to close");
        join_all(futures).await;

        drop(listeners);
        self.inner.groups.clear();
        info!("Cluster singleton service provider stopped");
    }
}

impl<E> ProviderInner<E>
where
    E: EntityOwnershipService,
{
    fn create_group(
        &self,
        identifier: ServiceGroupIdentifier,
        services: Vec<ServiceRegistration>,
    ) -> ServiceGroup<E> {
        let service_entity = create_entity(&self.config.service_entity_type, &identifier);
        let cleanup_entity = create_entity(&self.config.cleanup_entity_type, &identifier);

        ServiceGroup::Active(ActiveServiceGroup::new(
            identifier,
            Arc::clone(&self.eos),
            service_entity,
            cleanup_entity,
            services,
            self.runtime.clone(),
        ))
    }

    fn initialize_or_remove_group(&self, group: &ServiceGroup<E>) -> Result<(), Error> {
        if let Err(error) = group.initialize() {
            warn!(group = %group.identifier(), %error, "Failed to initialize service group");
            self.groups
                .remove_if(group.identifier(), |_, existing| existing.ptr_eq(group));
            return Err(error);
        }

        Ok(())
    }

    fn replace_group(
        &self,
        identifier: &ServiceGroupIdentifier,
        expected: &ServiceGroup<E>,
        replacement: ServiceGroup<E>,
    ) -> bool {
        // The previous group is dropped only after the shard lock is released.
        let previous = match self.groups.get_mut(identifier) {
            Some(mut entry) if entry.ptr_eq(expected) => {
                Some(std::mem::replace(entry.value_mut(), replacement))
            }
            _ => None,
        };

        previous.is_some()
    }

    fn remove_registration(inner: &Arc<Self>, registration: &ServiceRegistration) {
        let identifier = registration.identifier().clone();

        let (placeholder, future) = {
            let _listeners = inner.listeners.lock();
            let Some(group) = inner
                .groups
                .get(&identifier)
                .map(|group| group.value().clone())
            else {
                debug!(group = %identifier, %registration, "No service group, ignoring unregistration");
                return;
            };

            let active = match &group {
                ServiceGroup::Active(active) => Arc::clone(active),
                ServiceGroup::Placeholder(placeholder) => {
                    placeholder.unregister_service(registration);
                    return;
                }
            };

            let future = match active.unregister_service(registration) {
                Ok(Some(future)) => future,
                Ok(None) => return,
                Err(error) => {
                    warn!(group = %identifier, %registration, %error, "Failed to unregister service");
                    return;
                }
            };

            debug!(group = %identifier, "Closing service group");
            let placeholder = Arc::new(PlaceholderServiceGroup::new(
                Arc::clone(&active),
                future.clone(),
            ));
            let replaced = inner.replace_group(
                &identifier,
                &group,
                ServiceGroup::Placeholder(Arc::clone(&placeholder)),
            );
            assert!(replaced, "service group {identifier} was replaced concurrently");

            // Resolves to the same future the unregistration returned.
            let _closing = active.close_cluster_singleton_group();
            (placeholder, future)
        };

        if future.clone().now_or_never().is_some() {
            inner.finish_shutdown(&placeholder);
            return;
        }

        let weak = Arc::downgrade(inner);
        inner.runtime.spawn(async move {
            future.await;
            if let Some(inner) = weak.upgrade() {
                inner.finish_shutdown(&placeholder);
            }
        });
    }

    fn finish_shutdown(&self, placeholder: &Arc<PlaceholderServiceGroup<E>>) {
        let listeners = self.listeners.lock();
        let identifier = placeholder.identifier().clone();
        let expected = ServiceGroup::Placeholder(Arc::clone(placeholder));
        debug!(group = %identifier, "Service group closed");

        let services = placeholder.take_services();
        if listeners.is_none() && !services.is_empty() {
            debug!(group = %identifier, count = services.len(), "Provider closed, dropping queued services");
        }
        if listeners.is_none() || services.is_empty() {
            if self.groups.remove_if(&identifier, |_, existing| existing.ptr_eq(&expected)).is_some() {
                debug!(group = %identifier, "Removed closed service group");
            } else {
                debug!(group = %identifier, "Closed service group already superseded");
            }
            return;
        }

        let group = self.create_group(identifier.clone(), services);
        if !self.replace_group(&identifier, &expected, group.clone()) {
            debug!(group = %identifier, "Closed service group already superseded, dropping queued services");
            return;
        }

        placeholder.set_successor(group.clone());
        if let Err(error) = self.initialize_or_remove_group(&group) {
            error!(group = %identifier, %error, "Failed to initialize delayed service group, its services will not run");
        }
    }

    fn ownership_changed(
        &self,
        entity: &Entity,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        let Ok(identifier) = ServiceGroupIdentifier::new(service_identifier_from_entity(entity))
        else {
            debug!(%entity, "Ignoring ownership change of unnamed entity");
            return;
        };

        let group = self
            .groups
            .get(&identifier)
            .map(|group| group.value().clone());
        match group {
            Some(group) => group.ownership_changed(entity, change, in_jeopardy),
            None => debug!(%entity, %change, "No service group for ownership change"),
        }
    }
}

impl<E> Debug for ClusterSingletonServiceProvider<E>
where
    E: EntityOwnershipService,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSingletonServiceProvider")
            .field("config", &self.inner.config)
            .field("groups", &self.inner.groups.len())
            .finish_non_exhaustive()
    }
}
