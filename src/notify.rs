//! Close signal shared between a pool and the sessions it has leased out.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::Context;

use crate::BoxFuture;
use crate::session::CloseMode;

#[derive(Debug)]
pub(crate) struct Sender(tokio::sync::watch::Sender<Option<CloseMode>>);

impl Sender {
    /// Fire the signal. Only the first mode sent is observed.
    pub(crate) fn send(&self, mode: CloseMode) {
        let sent = self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(mode);
                true
            } else {
                false
            }
        });

        if sent {
            tracing::trace!(%mode, "sending close signal");
        }
    }

    pub(crate) fn mode(&self) -> Option<CloseMode> {
        *self.0.borrow()
    }

    pub(crate) fn subscribe(&self) -> Receiver {
        Receiver(self.0.subscribe())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Receiver(tokio::sync::watch::Receiver<Option<CloseMode>>);

impl Receiver {
    pub(crate) fn mode(&self) -> Option<CloseMode> {
        *self.0.borrow()
    }

    /// Wait for the signal to fire.
    ///
    /// If the sending pool is dropped without closing, this never resolves.
    pub(crate) async fn recv(&mut self) -> CloseMode {
        loop {
            if let Some(mode) = *self.0.borrow_and_update() {
                return mode;
            }

            if self.0.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl IntoFuture for Receiver {
    type IntoFuture = Notified;
    type Output = CloseMode;

    fn into_future(mut self) -> Self::IntoFuture {
        Notified(Box::pin(async move { self.recv().await }))
    }
}

/// Future which resolves with the mode the pool was closed with.
#[pin_project::pin_project]
pub struct Notified(#[pin] BoxFuture<'static, CloseMode>);

impl std::fmt::Debug for Notified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Notified").finish()
    }
}

impl Future for Notified {
    type Output = CloseMode;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> std::task::Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn channel() -> Sender {
    let (tx, _) = tokio::sync::watch::channel(None);
    Sender(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn receiver_notification() {
        let sender = channel();
        let receiver = sender.subscribe();

        let receiver_task = tokio::spawn(async move { receiver.await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.send(CloseMode::Immediate);

        let result = timeout(Duration::from_millis(100), receiver_task).await;
        assert_eq!(result.unwrap().unwrap(), CloseMode::Immediate);
    }

    #[tokio::test]
    async fn first_mode_wins() {
        let sender = channel();
        let receiver = sender.subscribe();
        assert_eq!(receiver.mode(), None);

        sender.send(CloseMode::Graceful);
        sender.send(CloseMode::Immediate);

        assert_eq!(sender.mode(), Some(CloseMode::Graceful));
        assert_eq!(receiver.mode(), Some(CloseMode::Graceful));
        assert_eq!(receiver.await, CloseMode::Graceful);
    }

    #[tokio::test]
    async fn subscribe_after_send() {
        let sender = channel();
        sender.send(CloseMode::Immediate);

        let mut receiver = sender.subscribe();
        let mode = timeout(Duration::from_millis(100), receiver.recv()).await;
        assert_eq!(mode.unwrap(), CloseMode::Immediate);
    }

    #[tokio::test]
    async fn receiver_clone() {
        let sender = channel();
        let receiver = sender.subscribe();
        let receiver_clone = receiver.clone();

        let first = tokio::spawn(async move { receiver.await });
        let second = tokio::spawn(async move { receiver_clone.await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.send(CloseMode::Graceful);

        let first = timeout(Duration::from_millis(100), first).await;
        let second = timeout(Duration::from_millis(100), second).await;
        assert_eq!(first.unwrap().unwrap(), CloseMode::Graceful);
        assert_eq!(second.unwrap().unwrap(), CloseMode::Graceful);
    }

    #[tokio::test]
    async fn dropped_sender_never_fires() {
        let sender = channel();
        let mut receiver = sender.subscribe();
        drop(sender);

        let result = timeout(Duration::from_millis(20), receiver.recv()).await;
        assert!(result.is_err());
    }
}
