//! Connectors establish new sessions for a route.
//!
//! The pool calls a connector whenever a lease request can be satisfied by creating a new
//! session, and never holds any of its locks while the connect future runs. Connect futures are
//! driven on their own task and are dropped (cancelled) when the pool closes, so a connector must
//! release any OS resources when its future is dropped.

use std::future::Future;
use std::task::{Context, Poll};

use tower::Service;

use crate::BoxError;
use crate::session::Session;

/// A connection initiator for routes of type `K`.
///
/// To implement a connector, implement a [`tower::Service`] which accepts a `&K` route key and
/// returns a [`Session`]. The connector is cloned for each connection attempt.
pub trait Connect<K>: Clone + Send + Sync + 'static {
    /// The session produced by this connector
    type Session: Session;

    /// Error returned when connecting fails
    type Error: Into<BoxError>;

    /// The future type returned by this connector
    type Future: Future<Output = Result<Self::Session, <Self as Connect<K>>::Error>> + Send + 'static;

    /// Start connecting to the given route.
    fn connect(&mut self, route: &K) -> <Self as Connect<K>>::Future;

    /// Poll the connector to see if it is ready to start a new connection.
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Connect<K>>::Error>>;
}

impl<T, K, S, F, E> Connect<K> for T
where
    T: for<'a> Service<&'a K, Response = S, Future = F, Error = E>,
    T: Clone + Send + Sync + 'static,
    S: Session,
    E: Into<BoxError>,
    F: Future<Output = Result<S, E>> + Send + 'static,
{
    type Session = S;
    type Error = E;
    type Future = F;

    fn connect(&mut self, route: &K) -> <Self as Connect<K>>::Future {
        self.call(route)
    }

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Connect<K>>::Error>> {
        Service::poll_ready(self, cx)
    }
}
