use std::fmt::{self, Debug};

use futures::future::{BoxFuture, Shared};

/// Completion of a service's stop, already mapped to `()`.
pub type StopFuture = Shared<BoxFuture<'static, ()>>;

/// Lifecycle state of a locally tracked service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// The service has been started.
    Started,

    /// The service is stopping and its stop future has not been observed complete.
    Stopping,
}

/// Immutable record of a service's state. A stop future is present exactly when stopping.
#[derive(Clone)]
pub struct ServiceInfo {
    state: ServiceState,
    future: Option<StopFuture>,
}

impl ServiceInfo {
    pub const fn started() -> Self {
        Self {
            state: ServiceState::Started,
            future: None,
        }
    }

    pub const fn state(&self) -> ServiceState {
        self.state
    }

    /// Derives a record in `state`.
    ///
    /// # Panics
    ///
    /// Panics if `state` is the current state, or if `future` is not present exactly when
    /// moving to [`ServiceState::Stopping`].
    pub fn to_state(&self, state: ServiceState, future: Option<StopFuture>) -> Self {
        assert_ne!(self.state, state, "service is already {state:?}");
        assert_eq!(
            future.is_some(),
            state == ServiceState::Stopping,
            "stop future must accompany exactly the stopping state"
        );

        Self { state, future }
    }

    /// Whether the stop future has completed.
    pub fn is_stopped(&self) -> bool {
        self.future
            .as_ref()
            .is_some_and(|future| future.peek().is_some())
    }
}

impl Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("state", &self.state)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::FutureExt;
    use futures::channel::oneshot;

    #[test]
    fn test_stopping_tracks_future() {
        let (tx, rx) = oneshot::channel::<()>();
        let future: StopFuture = rx.map(|_| ()).boxed().shared();

        let info = ServiceInfo::started().to_state(ServiceState::Stopping, Some(future.clone()));
        assert_eq!(info.state(), ServiceState::Stopping);
        assert!(!info.is_stopped());

        tx.send(()).unwrap();
        assert!(future.now_or_never().is_some());
        assert!(info.is_stopped());
    }

    #[test]
    fn test_started_is_never_stopped() {
        let info = ServiceInfo::started();
        assert!(info.future.is_none());
        assert!(!info.is_stopped());
    }

    #[test]
    #[should_panic(expected = "already")]
    fn test_same_state_transition_panics() {
        let _ = ServiceInfo::started().to_state(ServiceState::Started, None);
    }

    #[test]
    #[should_panic(expected = "stop future")]
    fn test_stopping_without_future_panics() {
        let _ = ServiceInfo::started().to_state(ServiceState::Stopping, None);
    }
}
