use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::Mutex;
use proven_eos::{Entity, EntityOwnershipService, EntityOwnershipStateChange};
use tracing::debug;

use super::{ActiveServiceGroup, CloseFuture, ServiceGroup};
use crate::{Error, ServiceGroupIdentifier, ServiceRegistration};

/// Stands in for a group whose last service was unregistered while the group shuts down.
///
/// Registrations arriving meanwhile are queued and seed the successor group once the
/// previous one has closed. Ownership changes still in flight for the previous group are
/// forwarded to it.
pub struct PlaceholderServiceGroup<E>
where
    E: EntityOwnershipService,
{
    identifier: ServiceGroupIdentifier,
    previous: Arc<ActiveServiceGroup<E>>,
    close_future: CloseFuture,
    services: Mutex<Vec<ServiceRegistration>>,
    successor: Mutex<Option<ServiceGroup<E>>>,
}

impl<E> PlaceholderServiceGroup<E>
where
    E: EntityOwnershipService,
{
    pub(crate) fn new(previous: Arc<ActiveServiceGroup<E>>, close_future: CloseFuture) -> Self {
        Self {
            identifier: previous.identifier().clone(),
            previous,
            close_future,
            services: Mutex::new(Vec::new()),
            successor: Mutex::new(None),
        }
    }

    /// The group identifier.
    #[must_use]
    pub const fn identifier(&self) -> &ServiceGroupIdentifier {
        &self.identifier
    }

    pub(crate) fn initialize(&self) -> Result<(), Error> {
        Err(Error::PlaceholderInitialize(self.identifier.clone()))
    }

    pub(crate) fn register_service(&self, registration: ServiceRegistration) {
        self.verify_no_successor();
        debug!(group = %self.identifier, %registration, "Queueing registration until the previous group closes");
        self.services.lock().push(registration);
    }

    pub(crate) fn unregister_service(&self, registration: &ServiceRegistration) {
        self.verify_no_successor();
        self.services.lock().retain(|queued| queued != registration);
    }

    pub(crate) fn ownership_changed(
        &self,
        entity: &Entity,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        self.previous.ownership_changed(entity, change, in_jeopardy);
    }

    pub(crate) fn close_cluster_singleton_group(&self) -> CloseFuture {
        let successor = self.successor.lock().clone();
        successor.map_or_else(
            || self.close_future.clone(),
            |successor| successor.close_cluster_singleton_group(),
        )
    }

    /// Drains the queued registrations.
    pub(crate) fn take_services(&self) -> Vec<ServiceRegistration> {
        self.verify_no_successor();
        std::mem::take(&mut *self.services.lock())
    }

    /// # Panics
    ///
    /// Panics if a successor has already been set.
    pub(crate) fn set_successor(&self, successor: ServiceGroup<E>) {
        let mut slot = self.successor.lock();
        assert!(
            slot.is_none(),
            "placeholder for {} already has a successor",
            self.identifier
        );
        *slot = Some(successor);
    }

    fn verify_no_successor(&self) {
        assert!(
            self.successor.lock().is_none(),
            "placeholder for {} has been superseded",
            self.identifier
        );
    }
}

impl<E> Debug for PlaceholderServiceGroup<E>
where
    E: EntityOwnershipService,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaceholderServiceGroup")
            .field("identifier", &self.identifier)
            .field("queued", &self.services.lock().len())
            .finish_non_exhaustive()
    }
}
