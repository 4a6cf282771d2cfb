//! Single-assignment result handle for an upgrade in flight.
use std::{cell::RefCell, fmt, future::Future, pin::Pin, task::Context, task::Poll};

use ntex_util::channel::oneshot;

use crate::error::UpgradeError;
use crate::session::Session;

type Outcome<T> = Result<Session<T>, UpgradeError>;

/// Create the two halves of a pending upgrade result.
///
/// The `Completion` side is resolved or rejected exactly once by the
/// upgrade machinery; the `PendingUpgrade` side is awaited by the caller.
pub fn pair<T>() -> (Completion<T>, PendingUpgrade<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion {
            tx: RefCell::new(Some(tx)),
        },
        PendingUpgrade { rx },
    )
}

/// Returned when a completion is attempted after the result already
/// reached a terminal state. This is a programming error in the caller of
/// `resolve`/`reject`, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed;

/// Write half of a pending upgrade result.
pub struct Completion<T> {
    tx: RefCell<Option<oneshot::Sender<Outcome<T>>>>,
}

impl<T> Completion<T> {
    /// Complete with an established session. The single success terminal
    /// state.
    pub fn resolve(&self, session: Session<T>) -> Result<(), Completed> {
        self.complete(Ok(session))
    }

    /// Complete with a failure.
    pub fn reject(&self, err: UpgradeError) -> Result<(), Completed> {
        self.complete(Err(err))
    }

    /// Check whether a terminal state was reached.
    pub fn is_completed(&self) -> bool {
        self.tx.borrow().is_none()
    }

    fn complete(&self, outcome: Outcome<T>) -> Result<(), Completed> {
        match self.tx.borrow_mut().take() {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    // caller dropped its handle; terminal state is reached
                    // regardless
                    log::trace!("upgrade result abandoned before completion");
                }
                Ok(())
            }
            None => {
                log::error!("upgrade result completed twice");
                Err(Completed)
            }
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Read half of a pending upgrade result; resolves once the upgrade
/// reaches a terminal state.
#[must_use = "futures do nothing unless polled"]
pub struct PendingUpgrade<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Future for PendingUpgrade<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|res| {
            match res {
                Ok(outcome) => outcome,
                // completion side dropped without a terminal state, which
                // only happens when the transport vanished underneath it
                Err(_) => Err(UpgradeError::ConnectionFailure(None)),
            }
        })
    }
}

impl<T> fmt::Debug for PendingUpgrade<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUpgrade").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestIo;

    #[ntex::test]
    async fn reject_is_terminal() {
        let (tx, rx) = pair::<TestIo>();
        assert!(!tx.is_completed());
        tx.reject(UpgradeError::ProtocolMismatch).unwrap();
        assert!(tx.is_completed());

        let err = rx.await.unwrap_err();
        assert!(matches!(err, UpgradeError::ProtocolMismatch));
    }

    #[ntex::test]
    async fn double_completion_is_detected() {
        let (tx, rx) = pair::<TestIo>();
        tx.reject(UpgradeError::ProtocolMismatch).unwrap();
        assert_eq!(
            tx.reject(UpgradeError::ConnectionFailure(None)),
            Err(Completed)
        );

        // the first outcome is the one observed
        let err = rx.await.unwrap_err();
        assert!(matches!(err, UpgradeError::ProtocolMismatch));
    }

    #[ntex::test]
    async fn dropped_completion_rejects() {
        let (tx, rx) = pair::<TestIo>();
        drop(tx);
        let err = rx.await.unwrap_err();
        assert!(matches!(err, UpgradeError::ConnectionFailure(None)));
    }

    #[ntex::test]
    async fn abandoned_handle_still_completes() {
        let (tx, rx) = pair::<TestIo>();
        drop(rx);
        tx.reject(UpgradeError::ProtocolMismatch).unwrap();
        assert!(tx.is_completed());
    }
}
