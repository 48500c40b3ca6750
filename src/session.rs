//! Sessions are the physical connections managed by the pool.
//!
//! A session might be a blocking-style HTTP/1.1 socket, where each lease carries exactly one
//! exchange, or a handle onto a multiplexed HTTP/2 session. The pool does not care which: it only
//! needs to know whether the session is still usable, how to close it, and (optionally) when it
//! last saw activity.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

/// How a session (or the whole pool) should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseMode {
    /// Signal the session to finish in-flight work and close once idle.
    Graceful,

    /// Close the session now, abandoning any in-flight work.
    Immediate,
}

impl fmt::Display for CloseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseMode::Graceful => f.write_str("graceful"),
            CloseMode::Immediate => f.write_str("immediate"),
        }
    }
}

/// Closes a session from outside of whoever currently owns it.
///
/// The pool keeps a handle for every leased session, so that closing the pool reaches sessions
/// which are still in a caller's hands.
#[derive(Clone)]
pub struct CloseHandle(Arc<dyn Fn(CloseMode) + Send + Sync>);

impl CloseHandle {
    /// Create a handle which runs `close` whenever it is asked to close the session.
    ///
    /// The closure may be called more than once, and concurrently with the session's owner.
    pub fn new<F>(close: F) -> Self
    where
        F: Fn(CloseMode) + Send + Sync + 'static,
    {
        Self(Arc::new(close))
    }

    /// Close the session with `mode`.
    pub fn close(&self, mode: CloseMode) {
        (self.0)(mode)
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle").finish_non_exhaustive()
    }
}

/// A transport session which can be held in a pool.
///
/// A session is owned exclusively by the pool while it is free, and by the caller while it is
/// leased, so implementations do not need interior synchronization for the pool's sake.
pub trait Session: Send + 'static {
    /// Returns `true` if the session can still carry requests.
    fn is_open(&self) -> bool;

    /// Close the session.
    ///
    /// [`CloseMode::Immediate`] must not block on the remote peer.
    fn close(&mut self, mode: CloseMode);

    /// A handle which closes this session without access to it.
    ///
    /// The pool uses this to close leased sessions when the pool itself is closed. Closing
    /// through the handle and then through [`Session::close`] must be harmless.
    fn close_handle(&self) -> CloseHandle;

    /// The last time this session observed I/O activity, if it tracks that.
    ///
    /// The pool uses the later of this and the time the session was last released when
    /// deciding whether an idle session needs validation.
    fn last_activity(&self) -> Option<Instant> {
        None
    }
}
