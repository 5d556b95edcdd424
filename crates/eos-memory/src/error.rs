use proven_eos::{Entity, EntityOwnershipError, EntityOwnershipErrorKind};
use thiserror::Error;

/// Errors that can occur when using the in-memory ownership service.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// This node already holds a candidacy for the entity.
    #[error("candidate already registered for {0}")]
    CandidateAlreadyRegistered(Entity),
}

impl EntityOwnershipError for Error {
    fn kind(&self) -> EntityOwnershipErrorKind {
        match self {
            Self::CandidateAlreadyRegistered(_) => EntityOwnershipErrorKind::CandidateAlreadyRegistered,
        }
    }
}
