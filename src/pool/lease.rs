use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use pin_project::pin_project;
use pin_project::pinned_drop;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::{Instant, Sleep};
use tracing::debug;
use tracing::trace;

use super::Recycle;
use super::RouteKey;
use super::Token;
use super::entry::{Affinity, Pooled};
use super::lock::WeakOpt;
use crate::error::LeaseError;
use crate::session::Session;

type Settlement<K, S> = Result<Pooled<K, S>, LeaseError>;

/// The pool's half of a lease request.
///
/// A waiter settles its request at most once: either with a session, or with an error.
pub(crate) struct Waiter<K, S>
where
    K: RouteKey,
    S: Session,
{
    pub(crate) id: Token,
    pub(crate) route: K,
    pub(crate) affinity: Option<Affinity>,
    deadline: Option<Instant>,
    tx: oneshot::Sender<Settlement<K, S>>,
}

impl<K, S> fmt::Debug for Waiter<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("affinity", &self.affinity)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl<K, S> Waiter<K, S>
where
    K: RouteKey,
    S: Session,
{
    /// The requester has gone away, either by cancelling or dropping its `Lease`.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn fail(self, error: LeaseError) {
        trace!(id=?self.id, route=?self.route, %error, "failing lease request");
        if self.tx.send(Err(error)).is_err() {
            trace!(id=?self.id, "lease request already settled");
        }
    }

    /// Hand the session to the requester.
    ///
    /// If the requester has already gone away the session is dropped here, which
    /// returns it to the pool.
    pub(crate) fn fulfil(self, pooled: Pooled<K, S>) -> bool {
        match self.tx.send(Ok(pooled)) {
            Ok(()) => true,
            Err(returned) => {
                trace!(id=?self.id, "lease request already settled, recycling session");
                drop(returned);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Cancelled,
    Complete,
}

/// A pending request for a pooled session.
///
/// A `Lease` settles exactly once, with a [`Pooled`] session or a [`LeaseError`]. Dropping an
/// unsettled `Lease` cancels the request, and a session delivered concurrently with the drop
/// is returned to the pool rather than leaked.
#[pin_project(PinnedDrop)]
pub struct Lease<K, S>
where
    K: RouteKey,
    S: Session,
{
    id: Token,
    route: K,
    pool: WeakOpt<dyn Recycle<K, S>>,
    receiver: oneshot::Receiver<Settlement<K, S>>,
    settled: Option<Settlement<K, S>>,
    #[pin]
    deadline: Option<Sleep>,
    state: State,
}

impl<K, S> fmt::Debug for Lease<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("state", &self.state)
            .finish()
    }
}

/// Create a linked lease and waiter pair.
pub(crate) fn request<K, S>(
    id: Token,
    route: K,
    affinity: Option<Affinity>,
    deadline: Option<Instant>,
    pool: WeakOpt<dyn Recycle<K, S>>,
) -> (Lease<K, S>, Waiter<K, S>)
where
    K: RouteKey,
    S: Session,
{
    let (tx, rx) = oneshot::channel();

    let lease = Lease {
        id,
        route: route.clone(),
        pool,
        receiver: rx,
        settled: None,
        deadline: deadline.map(tokio::time::sleep_until),
        state: State::Waiting,
    };

    let waiter = Waiter {
        id,
        route,
        affinity,
        deadline,
        tx,
    };

    (lease, waiter)
}

fn forget<K, S>(pool: &WeakOpt<dyn Recycle<K, S>>, route: &K, id: Token) -> bool
where
    K: RouteKey,
    S: Session,
{
    pool.upgrade()
        .map(|pool| pool.forget(route, id))
        .unwrap_or(false)
}

impl<K, S> Lease<K, S>
where
    K: RouteKey,
    S: Session,
{
    /// The route this lease was requested for.
    pub fn route(&self) -> &K {
        &self.route
    }

    /// Cancel the lease request.
    ///
    /// Returns `true` if this call cancelled the request, in which case polling the lease
    /// resolves to [`LeaseError::Cancelled`]. Returns `false` if the request had already
    /// settled (or was already cancelled), in which case the settled outcome is still
    /// available by polling.
    pub fn cancel(self: Pin<&mut Self>) -> bool {
        let this = self.project();
        if *this.state != State::Waiting || this.settled.is_some() {
            return false;
        }

        match this.receiver.try_recv() {
            Ok(settlement) => {
                *this.settled = Some(settlement);
                return false;
            }
            Err(TryRecvError::Closed) => {
                *this.settled = Some(Err(LeaseError::Closed));
                return false;
            }
            Err(TryRecvError::Empty) => {}
        }

        forget(this.pool, this.route, *this.id);
        this.receiver.close();

        // A session may have been delivered between the first check and closing the channel.
        match this.receiver.try_recv() {
            Ok(settlement) => {
                trace!(id=?this.id, "lease settled while cancelling");
                *this.settled = Some(settlement);
                false
            }
            Err(_) => {
                trace!(id=?this.id, route=?this.route, "lease cancelled");
                *this.state = State::Cancelled;
                true
            }
        }
    }
}

impl<K, S> Future for Lease<K, S>
where
    K: RouteKey,
    S: Session,
{
    type Output = Result<Pooled<K, S>, LeaseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        match *this.state {
            State::Complete => panic!("Lease polled after completion"),
            State::Cancelled => {
                *this.state = State::Complete;
                return Poll::Ready(Err(LeaseError::Cancelled));
            }
            State::Waiting => {}
        }

        if let Some(settlement) = this.settled.take() {
            *this.state = State::Complete;
            return Poll::Ready(settlement);
        }

        if let Poll::Ready(outcome) = Pin::new(&mut *this.receiver).poll(cx) {
            *this.state = State::Complete;
            return Poll::Ready(outcome.unwrap_or_else(|_| {
                trace!(id=?this.id, "pool dropped while lease was waiting");
                Err(LeaseError::Closed)
            }));
        }

        if let Some(deadline) = this.deadline.as_mut().as_pin_mut() {
            ready!(deadline.poll(cx));

            forget(this.pool, this.route, *this.id);
            this.receiver.close();
            *this.state = State::Complete;

            return match this.receiver.try_recv() {
                Ok(settlement) => {
                    trace!(id=?this.id, "lease settled at its deadline");
                    Poll::Ready(settlement)
                }
                Err(_) => {
                    debug!(id=?this.id, route=?this.route, "lease timed out");
                    Poll::Ready(Err(LeaseError::Timeout))
                }
            };
        }

        Poll::Pending
    }
}

#[pinned_drop]
impl<K, S> PinnedDrop for Lease<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.state == State::Waiting && this.settled.is_none() {
            trace!(id=?this.id, "lease dropped while waiting");
            forget(this.pool, this.route, *this.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pool::key::TokenCounter;
    use crate::pool::mock::MockSession;

    assert_impl_all!(Lease<String, MockSession>: Send, Future, fmt::Debug);

    fn detached(
        deadline: Option<Instant>,
    ) -> (Lease<&'static str, MockSession>, Waiter<&'static str, MockSession>) {
        let tokens = TokenCounter::default();
        request(tokens.next(), "route", None, deadline, WeakOpt::none())
    }

    #[tokio::test]
    async fn settles_with_error() {
        let (lease, waiter) = detached(None);
        waiter.fail(LeaseError::Timeout);

        let err = lease.await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn dropped_waiter_is_closed() {
        let (lease, waiter) = detached(None);
        drop(waiter);

        let err = lease.await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn cancel_pending() {
        let (lease, waiter) = detached(None);
        let mut lease = std::pin::pin!(lease);

        assert!(futures::poll!(lease.as_mut()).is_pending());
        assert!(!waiter.is_cancelled());

        assert!(lease.as_mut().cancel());
        assert!(waiter.is_cancelled());
        assert!(!lease.as_mut().cancel());

        let err = lease.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_after_settled() {
        let (lease, waiter) = detached(None);
        let mut lease = std::pin::pin!(lease);
        waiter.fail(LeaseError::Closed);

        assert!(!lease.as_mut().cancel());
        let err = lease.await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline() {
        let (lease, waiter) = detached(Some(Instant::now() + Duration::from_secs(1)));
        assert!(!waiter.is_expired(Instant::now()));

        let err = lease.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(waiter.is_expired(Instant::now()));
        assert!(waiter.is_cancelled());
    }
}
