//! Mock sessions and connectors, suitable for testing pool behavior without any I/O.

use std::fmt;
use std::future::{pending, ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::RouteKey;
use crate::BoxFuture;
use crate::session::{CloseHandle, CloseMode, Session};

static SESSION_ID: AtomicUsize = AtomicUsize::new(1);

/// Identifies a mock session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(usize);

impl SessionId {
    fn new() -> Self {
        SessionId(SESSION_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug)]
struct State {
    open: AtomicBool,
    closed_with: Mutex<Option<CloseMode>>,
    last_activity: Mutex<Option<Instant>>,
}

impl State {
    fn close(&self, mode: CloseMode) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_with.lock().get_or_insert(mode);
    }
}

/// A session which does nothing, but records how the pool treated it.
#[derive(Debug)]
pub struct MockSession {
    id: SessionId,
    state: Arc<State>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Create a new, open session.
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            state: Arc::new(State {
                open: AtomicBool::new(true),
                closed_with: Mutex::new(None),
                last_activity: Mutex::new(None),
            }),
        }
    }

    /// The session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// A handle for observing this session after it has been given to the pool.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            id: self.id,
            state: self.state.clone(),
        }
    }

    /// Record activity on the session now.
    pub fn touch(&self) {
        *self.state.last_activity.lock() = Some(Instant::now());
    }
}

impl Session for MockSession {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn close(&mut self, mode: CloseMode) {
        tracing::trace!(id=%self.id, %mode, "closing mock session");
        self.state.close(mode);
    }

    fn close_handle(&self) -> CloseHandle {
        let id = self.id;
        let state = self.state.clone();
        CloseHandle::new(move |mode| {
            tracing::trace!(%id, %mode, "closing mock session through its handle");
            state.close(mode);
        })
    }

    fn last_activity(&self) -> Option<Instant> {
        *self.state.last_activity.lock()
    }
}

/// Observes a [`MockSession`] from outside the pool.
#[derive(Debug, Clone)]
pub struct MockHandle {
    id: SessionId,
    state: Arc<State>,
}

impl MockHandle {
    /// The session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session is still open.
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// The mode the pool closed the session with, if it closed it.
    pub fn closed_with(&self) -> Option<CloseMode> {
        *self.state.closed_with.lock()
    }

    /// Simulate the remote peer dropping the session.
    pub fn kill(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    /// Record activity on the session now.
    pub fn touch(&self) {
        *self.state.last_activity.lock() = Some(Instant::now());
    }
}

/// An error returned by a mock connector.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection refused")]
pub struct MockConnectError;

type Outcomes = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<MockSession, MockConnectError>>>>;

#[derive(Clone)]
enum Mode {
    Ready,
    Refuse,
    Never,
    Delayed(Duration),
    Channel(Outcomes),
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Ready => f.write_str("Ready"),
            Mode::Refuse => f.write_str("Refuse"),
            Mode::Never => f.write_str("Never"),
            Mode::Delayed(delay) => f.debug_tuple("Delayed").field(delay).finish(),
            Mode::Channel(_) => f.write_str("Channel"),
        }
    }
}

/// A connector which produces [`MockSession`]s.
#[derive(Debug, Clone)]
pub struct MockConnector {
    mode: Mode,
    attempts: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockConnector {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            attempts: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Connector which connects immediately.
    pub fn ready() -> Self {
        Self::new(Mode::Ready)
    }

    /// Connector which always fails.
    pub fn refuse() -> Self {
        Self::new(Mode::Refuse)
    }

    /// Connector whose attempts never finish.
    pub fn never() -> Self {
        Self::new(Mode::Never)
    }

    /// Connector which connects after `delay`.
    pub fn delayed(delay: Duration) -> Self {
        Self::new(Mode::Delayed(delay))
    }

    /// Connector whose attempts each take the next outcome sent on the returned channel.
    ///
    /// Attempts made after the sender is dropped fail.
    pub fn channel() -> (
        Self,
        mpsc::UnboundedSender<Result<MockSession, MockConnectError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self::new(Mode::Channel(Arc::new(tokio::sync::Mutex::new(rx))));
        (connector, tx)
    }

    /// The number of connection attempts started.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Handles for every session this connector has produced.
    pub fn sessions(&self) -> Vec<MockHandle> {
        self.sessions.lock().clone()
    }
}

impl<'a, K> tower::Service<&'a K> for MockConnector
where
    K: RouteKey,
{
    type Response = MockSession;
    type Error = MockConnectError;
    type Future = BoxFuture<'static, Result<MockSession, MockConnectError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, route: &'a K) -> Self::Future {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(?route, attempt, mode=?self.mode, "mock connect");

        let sessions = self.sessions.clone();
        let record = move |session: MockSession| {
            sessions.lock().push(session.handle());
            session
        };

        match &self.mode {
            Mode::Ready => Box::pin(ready(Ok(record(MockSession::new())))),
            Mode::Refuse => Box::pin(ready(Err(MockConnectError))),
            Mode::Never => Box::pin(pending()),
            Mode::Delayed(delay) => {
                let delay = *delay;
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(record(MockSession::new()))
                })
            }
            Mode::Channel(outcomes) => {
                let outcomes = outcomes.clone();
                Box::pin(async move {
                    match outcomes.lock().await.recv().await {
                        Some(Ok(session)) => Ok(record(session)),
                        Some(Err(error)) => Err(error),
                        None => Err(MockConnectError),
                    }
                })
            }
        }
    }
}
