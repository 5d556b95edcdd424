mod active;
mod placeholder;

pub use active::ActiveServiceGroup;
pub use placeholder::PlaceholderServiceGroup;

use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use proven_eos::{Entity, EntityOwnershipService, EntityOwnershipStateChange};

use crate::{Error, ServiceGroupIdentifier, ServiceRegistration};

/// Completes once a service group has stopped all its services and released its entities.
pub type CloseFuture = Shared<BoxFuture<'static, ()>>;

/// One-shot completion backing a [`CloseFuture`].
pub(crate) struct CloseSignal {
    sender: Mutex<Option<oneshot::Sender<()>>>,
    future: CloseFuture,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();

        Self {
            sender: Mutex::new(Some(sender)),
            future: receiver.map(|_| ()).boxed().shared(),
        }
    }

    pub fn future(&self) -> CloseFuture {
        self.future.clone()
    }

    /// Returns `false` if already completed.
    pub fn complete(&self) -> bool {
        let sender = self.sender.lock().take();
        sender.is_some_and(|sender| {
            let _ = sender.send(());
            true
        })
    }
}

/// A service group as held by the provider.
///
/// The variants are the only implementations; each shares the same caller-facing contract.
pub enum ServiceGroup<E>
where
    E: EntityOwnershipService,
{
    /// A group taking part in ownership elections.
    Active(Arc<ActiveServiceGroup<E>>),

    /// A stand-in while the previous group for the identifier shuts down.
    Placeholder(Arc<PlaceholderServiceGroup<E>>),
}

impl<E> Clone for ServiceGroup<E>
where
    E: EntityOwnershipService,
{
    fn clone(&self) -> Self {
        match self {
            Self::Active(group) => Self::Active(Arc::clone(group)),
            Self::Placeholder(group) => Self::Placeholder(Arc::clone(group)),
        }
    }
}

impl<E> ServiceGroup<E>
where
    E: EntityOwnershipService,
{
    /// The group identifier.
    #[must_use]
    pub fn identifier(&self) -> &ServiceGroupIdentifier {
        match self {
            Self::Active(group) => group.identifier(),
            Self::Placeholder(group) => group.identifier(),
        }
    }

    /// Registers the group's service entity candidacy.
    ///
    /// # Errors
    ///
    /// See [`ActiveServiceGroup::initialize`]. Placeholders cannot be initialized.
    pub fn initialize(&self) -> Result<(), Error> {
        match self {
            Self::Active(group) => group.initialize(),
            Self::Placeholder(group) => group.initialize(),
        }
    }

    /// Adds a service to the group.
    ///
    /// # Errors
    ///
    /// See [`ActiveServiceGroup::register_service`].
    pub fn register_service(&self, registration: ServiceRegistration) -> Result<(), Error> {
        match self {
            Self::Active(group) => group.register_service(registration),
            Self::Placeholder(group) => {
                group.register_service(registration);
                Ok(())
            }
        }
    }

    /// Removes a service from the group, returning the close future if it was the last one.
    ///
    /// # Errors
    ///
    /// See [`ActiveServiceGroup::unregister_service`].
    pub fn unregister_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<Option<CloseFuture>, Error> {
        match self {
            Self::Active(group) => group.unregister_service(registration),
            Self::Placeholder(group) => {
                group.unregister_service(registration);
                Ok(None)
            }
        }
    }

    /// Delivers an ownership change for one of the group's entities.
    pub fn ownership_changed(
        &self,
        entity: &Entity,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    ) {
        match self {
            Self::Active(group) => group.ownership_changed(entity, change, in_jeopardy),
            Self::Placeholder(group) => group.ownership_changed(entity, change, in_jeopardy),
        }
    }

    /// Stops every service and releases the group's entities.
    pub fn close_cluster_singleton_group(&self) -> CloseFuture {
        match self {
            Self::Active(group) => group.close_cluster_singleton_group(),
            Self::Placeholder(group) => group.close_cluster_singleton_group(),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Active(a), Self::Active(b)) => Arc::ptr_eq(a, b),
            (Self::Placeholder(a), Self::Placeholder(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
