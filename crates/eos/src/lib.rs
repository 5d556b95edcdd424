//! Abstract interface for cluster-wide entity ownership.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// An ownership slot. Exactly one candidate across the cluster owns an entity at a time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    entity_type: String,
    name: String,
}

impl Entity {
    /// Creates a new entity of the given type and name.
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }

    /// The entity type. Listeners subscribe per type.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The entity name, unique within its type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity_type, self.name)
    }
}

/// A change in ownership of an entity, as observed by one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityOwnershipStateChange {
    /// This node was granted ownership.
    LocalOwnershipGranted,

    /// This node remains the owner. Typically delivered alongside a jeopardy flag change.
    LocalOwnershipRetainedWithNoChange,

    /// This node lost ownership to another node.
    LocalOwnershipLostNewOwner,

    /// This node lost ownership and no other node owns the entity.
    LocalOwnershipLostNoOwner,

    /// Ownership moved between other nodes, or this node learned who the remote owner is.
    RemoteOwnershipChanged,

    /// A remote owner lost ownership and nobody owns the entity.
    RemoteOwnershipLostNoOwner,
}

impl EntityOwnershipStateChange {
    /// Derives the change from the observing node's point of view.
    #[must_use]
    pub const fn from_flags(was_owner: bool, is_owner: bool, has_owner: bool) -> Self {
        match (was_owner, is_owner) {
            (false, true) => Self::LocalOwnershipGranted,
            (true, true) => Self::LocalOwnershipRetainedWithNoChange,
            (true, false) if has_owner => Self::LocalOwnershipLostNewOwner,
            (true, false) => Self::LocalOwnershipLostNoOwner,
            (false, false) if has_owner => Self::RemoteOwnershipChanged,
            (false, false) => Self::RemoteOwnershipLostNoOwner,
        }
    }

    /// Whether the observing node owned the entity before this change.
    #[must_use]
    pub const fn was_owner(self) -> bool {
        matches!(
            self,
            Self::LocalOwnershipRetainedWithNoChange
                | Self::LocalOwnershipLostNewOwner
                | Self::LocalOwnershipLostNoOwner
        )
    }

    /// Whether the observing node owns the entity after this change.
    #[must_use]
    pub const fn is_owner(self) -> bool {
        matches!(
            self,
            Self::LocalOwnershipGranted | Self::LocalOwnershipRetainedWithNoChange
        )
    }

    /// Whether any node owns the entity after this change.
    #[must_use]
    pub const fn has_owner(self) -> bool {
        !matches!(
            self,
            Self::LocalOwnershipLostNoOwner | Self::RemoteOwnershipLostNoOwner
        )
    }
}

impl Display for EntityOwnershipStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalOwnershipGranted => "LOCAL_OWNERSHIP_GRANTED",
            Self::LocalOwnershipRetainedWithNoChange => "LOCAL_OWNERSHIP_RETAINED_WITH_NO_CHANGE",
            Self::LocalOwnershipLostNewOwner => "LOCAL_OWNERSHIP_LOST_NEW_OWNER",
            Self::LocalOwnershipLostNoOwner => "LOCAL_OWNERSHIP_LOST_NO_OWNER",
            Self::RemoteOwnershipChanged => "REMOTE_OWNERSHIP_CHANGED",
            Self::RemoteOwnershipLostNoOwner => "REMOTE_OWNERSHIP_LOST_NO_OWNER",
        };
        f.write_str(name)
    }
}

/// Point-in-time ownership of an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityOwnershipState {
    /// This node owns the entity.
    IsOwner,

    /// Another node owns the entity.
    OwnedByOther,

    /// Candidates may exist, but nobody owns the entity.
    NoOwner,
}

/// The kind of entity ownership error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EntityOwnershipErrorKind {
    /// This node already has a live candidacy for the entity.
    CandidateAlreadyRegistered,

    /// The service has been shut down.
    Closed,

    /// Other/unknown error
    Other,
}

impl Display for EntityOwnershipErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Marker trait for `EntityOwnershipService` errors
pub trait EntityOwnershipError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> EntityOwnershipErrorKind;
}

/// Receives ownership changes for the entity types it was registered for.
///
/// Implementations may be invoked from any thread, including from within a call the
/// listener itself made into the ownership service.
pub trait EntityOwnershipListener: Send + Sync + 'static {
    /// Called when ownership of `entity` changes, or when the jeopardy flag flips.
    fn ownership_changed(
        &self,
        entity: &Entity,
        change: EntityOwnershipStateChange,
        in_jeopardy: bool,
    );
}

/// A cluster-wide entity ownership service.
///
/// Registrations are guards: dropping a candidate registration withdraws the candidacy,
/// dropping a listener registration stops notifications.
pub trait EntityOwnershipService
where
    Self: Send + Sync + 'static,
{
    /// The error type for ownership operations.
    type Error: EntityOwnershipError;

    /// Guard for a candidacy.
    type CandidateRegistration: Send + Sync + 'static;

    /// Guard for a listener.
    type ListenerRegistration: Send + Sync + 'static;

    /// Registers this node as a candidate for ownership of `entity`.
    ///
    /// # Errors
    ///
    /// Fails with kind [`EntityOwnershipErrorKind::CandidateAlreadyRegistered`] if this node
    /// already holds a live candidacy for the entity.
    fn register_candidate(&self, entity: &Entity) -> Result<Self::CandidateRegistration, Self::Error>;

    /// Registers a listener for all entities of `entity_type`. Current ownership of existing
    /// entities of that type is replayed to the listener before this returns.
    fn register_listener(
        &self,
        entity_type: &str,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> Self::ListenerRegistration;

    /// Returns the current ownership of `entity`, or `None` if it has no candidates at all.
    fn ownership_state(&self, entity: &Entity) -> Option<EntityOwnershipState>;

    /// Whether this node currently holds a candidacy for `entity`.
    fn is_candidate_registered(&self, entity: &Entity) -> bool;
}
