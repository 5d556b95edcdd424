use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{ClusterSingletonService, ServiceGroupIdentifier};

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

type OnClose = Box<dyn Fn(&ServiceRegistration) + Send + Sync>;

struct Inner {
    id: u64,
    instance: Arc<dyn ClusterSingletonService>,
    closed: AtomicBool,
    on_close: OnClose,
}

/// Handle for a registered [`ClusterSingletonService`].
///
/// Registrations compare by identity: two registrations of the same service instance are
/// distinct members of their group. Clones refer to the same registration.
#[derive(Clone)]
pub struct ServiceRegistration {
    inner: Arc<Inner>,
}

impl ServiceRegistration {
    /// Creates a registration for `instance`. `on_close` runs exactly once, on the first call
    /// to [`close`](Self::close).
    pub fn new(
        instance: Arc<dyn ClusterSingletonService>,
        on_close: impl Fn(&Self) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed),
                instance,
                closed: AtomicBool::new(false),
                on_close: Box::new(on_close),
            }),
        }
    }

    /// The registered service.
    #[must_use]
    pub fn instance(&self) -> &Arc<dyn ClusterSingletonService> {
        &self.inner.instance
    }

    /// The group identifier of the registered service.
    #[must_use]
    pub fn identifier(&self) -> &ServiceGroupIdentifier {
        self.inner.instance.identifier()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Withdraws the service. Subsequent calls do nothing.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            (self.inner.on_close)(self);
        }
    }
}

impl PartialEq for ServiceRegistration {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ServiceRegistration {}

impl Hash for ServiceRegistration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("id", &self.inner.id)
            .field("identifier", self.identifier())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Display for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration-{}({})", self.inner.id, self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use crate::BoxError;

    struct Noop(ServiceGroupIdentifier);

    impl ClusterSingletonService for Noop {
        fn identifier(&self) -> &ServiceGroupIdentifier {
            &self.0
        }

        fn instantiate_service_instance(&self) -> Result<(), BoxError> {
            Ok(())
        }

        fn close_service_instance(
            &self,
        ) -> Result<BoxFuture<'static, Result<(), BoxError>>, BoxError> {
            Ok(futures::future::ready(Ok(())).boxed())
        }
    }

    #[test]
    fn test_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let instance = Arc::new(Noop(ServiceGroupIdentifier::new("group").unwrap()));
        let registration = ServiceRegistration::new(instance, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!registration.is_closed());
        registration.close();
        registration.clone().close();
        assert!(registration.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_equality() {
        let instance: Arc<dyn ClusterSingletonService> =
            Arc::new(Noop(ServiceGroupIdentifier::new("group").unwrap()));
        let first = ServiceRegistration::new(Arc::clone(&instance), |_| {});
        let second = ServiceRegistration::new(instance, |_| {});

        assert_eq!(first, first.clone());
        assert_ne!(first, second);
        assert_eq!(first.identifier(), second.identifier());
    }
}
