use std::fmt::{self, Display};

use futures::future::BoxFuture;

use crate::Error;

/// Error type returned by service lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identifies a group of singleton services which must run on the same node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceGroupIdentifier(String);

impl ServiceGroupIdentifier {
    /// Creates a new identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyIdentifier`] if `value` is empty.
    pub fn new(value: impl Into<String>) -> Result<Self, Error> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::EmptyIdentifier);
        }

        Ok(Self(value))
    }

    /// The identifier value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceGroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A service of which at most one instance runs across the cluster at any time.
pub trait ClusterSingletonService
where
    Self: Send + Sync + 'static,
{
    /// The group this service belongs to.
    fn identifier(&self) -> &ServiceGroupIdentifier;

    /// Starts the local instance. Called when this node becomes the group owner.
    ///
    /// # Errors
    ///
    /// A failure is logged and the service is left stopped; it is retried on the next
    /// ownership change.
    fn instantiate_service_instance(&self) -> Result<(), BoxError>;

    /// Starts stopping the local instance. The returned future completes once the instance is
    /// fully stopped; only then may another node start its instance.
    ///
    /// # Errors
    ///
    /// A failure, either returned here or from the future, is logged and the service is
    /// treated as stopped.
    fn close_service_instance(&self) -> Result<BoxFuture<'static, Result<(), BoxError>>, BoxError>;
}
