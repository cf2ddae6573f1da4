//! Caller-driven cancellation for long-running provider calls.

use tokio::sync::watch;

/// Cancellation signal passed into Create and Delete.
///
/// Cloning is cheap. A `Cancel` built with [`Cancel::never`] never fires.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    rx: Option<watch::Receiver<bool>>,
}

/// The sending half of a [`Cancel`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancel {
    pub fn new() -> (CancelHandle, Cancel) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancel { rx: Some(rx) })
    }

    pub fn never() -> Self {
        Self::default()
    }

    /// Wrap an existing shutdown channel.
    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancelled. Stays pending forever if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
            if fired {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_after_cancel() {
        let (handle, cancel) = Cancel::new();
        assert!(!cancel.is_cancelled());

        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn never_stays_pending() {
        let cancel = Cancel::never();
        assert!(!cancel.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(20), cancel.cancelled()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (handle, cancel) = Cancel::new();
        drop(handle);
        let res = tokio::time::timeout(Duration::from_millis(20), cancel.cancelled()).await;
        assert!(res.is_err());
        assert!(!cancel.is_cancelled());
    }
}
