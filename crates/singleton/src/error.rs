use proven_eos::EntityOwnershipErrorKind;
use thiserror::Error;

use crate::{BoxError, ServiceGroupIdentifier};

/// Errors returned by service groups and the provider.
#[derive(Debug, Error)]
pub enum Error {
    /// A service group identifier was empty.
    #[error("service group identifier must not be empty")]
    EmptyIdentifier,

    /// `initialize` was called on a group that is already initialized.
    #[error("service group {0} was already initialized")]
    AlreadyInitialized(ServiceGroupIdentifier),

    /// A service was registered before the group was initialized.
    #[error("service group {0} is not initialized yet")]
    NotInitialized(ServiceGroupIdentifier),

    /// The group is closing or closed.
    #[error("service group {0} has already been closed")]
    GroupClosed(ServiceGroupIdentifier),

    /// A service was handed to a group with a different identifier.
    #[error("service {service} does not belong to service group {group}")]
    ForeignService {
        /// The group the service was handed to.
        group: ServiceGroupIdentifier,
        /// The identifier the service reports.
        service: ServiceGroupIdentifier,
    },

    /// The registration is already a member of the group.
    #[error("{registration} is already a member of service group {group}")]
    DuplicateMember {
        /// The group.
        group: ServiceGroupIdentifier,
        /// The offending registration.
        registration: String,
    },

    /// The registration is not a member of the group.
    #[error("{registration} is not a member of service group {group}")]
    UnknownMember {
        /// The group.
        group: ServiceGroupIdentifier,
        /// The offending registration.
        registration: String,
    },

    /// Placeholder groups only stand in for groups being torn down.
    #[error("placeholder for service group {0} cannot be initialized")]
    PlaceholderInitialize(ServiceGroupIdentifier),

    /// The ownership service refused the service entity candidacy.
    #[error("service group {identifier} failed to register its candidate ({kind}): {source}")]
    CandidateRegistration {
        /// The group.
        identifier: ServiceGroupIdentifier,
        /// What went wrong, as classified by the ownership service.
        kind: EntityOwnershipErrorKind,
        /// The ownership service error.
        #[source]
        source: BoxError,
    },

    /// The provider has been closed.
    #[error("cluster singleton service provider is closed")]
    ProviderClosed,
}
