//! # Paddock: an asynchronous keyed connection pool
//!
//! Paddock manages reusable transport sessions (HTTP/1.1 sockets, HTTP/2 sessions, or anything
//! else that implements [`Session`]) on behalf of protocol-layer requesters. It bounds the
//! number of concurrently leased sessions per destination and in aggregate, reuses idle sessions
//! safely, queues excess demand, and guarantees that every acquisition request settles exactly
//! once, even when cancellation, timeouts and shutdown race with one another.
//!
//! ## Architecture Overview
//!
//! The pool is partitioned by a *route key* (for example a scheme/host/port triple). Each route
//! owns a sub-pool holding its free sessions, the identities of its leased sessions, and (under
//! [`ConcurrencyPolicy::Lax`]) its queue of pending requests. The pool itself tracks the global
//! leased count and, under [`ConcurrencyPolicy::Strict`], a single pool-wide queue ordered by
//! arrival.
//!
//! The pool never performs I/O itself. It delegates to two collaborators:
//!
//! - **Connect**: establishes a new session for a route. Any [`tower::Service`] accepting a
//!   `&K` route key and returning a [`Session`] can be used.
//! - **Validate**: cheaply probes an idle session before it is handed out again, once the
//!   session has been idle for longer than the configured validate-after-inactivity threshold.
//!
//! ## Leasing
//!
//! [`Pool::lease`] returns a [`Lease`], a future which settles to a [`Pooled`] session, or to a
//! [`LeaseError`] distinguishing timeout, pool closure, cancellation and connect failure. A
//! `Lease` may be cancelled explicitly with [`Lease::cancel`] or implicitly by dropping it.
//!
//! A [`Pooled`] session is exclusively owned by the caller until it is released, either with
//! [`Pooled::release`] or by dropping it. Freed capacity is immediately offered to the
//! longest-waiting eligible request.
//!
//! ## Shutdown
//!
//! [`Pool::close`] rejects new leases, fails every queued request, closes free sessions and
//! cancels in-flight connects and validations. Leased sessions are closed with the requested
//! [`CloseMode`] through their [`CloseHandle`], and their holders are signalled (see
//! [`Pooled::closing`]). It never waits for graceful drains to finish.
//!
//! ## Feature Flags
//!
//! - `mock`: Exposes the mock session and connector used by this crate's own tests.
//!
//! [`Session`]: crate::session::Session
//! [`CloseMode`]: crate::session::CloseMode
//! [`CloseHandle`]: crate::session::CloseHandle
//! [`ConcurrencyPolicy::Lax`]: crate::pool::ConcurrencyPolicy::Lax
//! [`ConcurrencyPolicy::Strict`]: crate::pool::ConcurrencyPolicy::Strict
//! [`Pool::lease`]: crate::pool::Pool::lease
//! [`Pool::close`]: crate::pool::Pool::close
//! [`Lease`]: crate::pool::Lease
//! [`Lease::cancel`]: crate::pool::Lease::cancel
//! [`Pooled`]: crate::pool::Pooled
//! [`Pooled::release`]: crate::pool::Pooled::release
//! [`Pooled::closing`]: crate::pool::Pooled::closing
//! [`LeaseError`]: crate::LeaseError

use std::{fmt, pin::Pin};

pub mod connect;
mod error;
mod notify;
pub mod pool;
pub mod session;
pub mod validate;

pub use self::error::{ConnectError, LeaseError};
pub use self::pool::{Config, Lease, Pool, Pooled};
pub use self::session::{CloseHandle, CloseMode, Session};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed error, used where collaborator errors are type-erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
