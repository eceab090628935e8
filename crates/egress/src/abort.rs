use tokio::sync::watch;

/// Why a request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Timeout,
    Disposed,
}

impl core::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Disposed => f.write_str("gateway disposed"),
        }
    }
}

/// One-shot cancellation token. The first reason recorded wins; later calls
/// to [`AbortController::abort`] observe it and change nothing.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<Option<AbortReason>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Abort with `reason` unless already aborted. Returns the reason that is
    /// in effect afterwards.
    pub fn abort(&self, reason: AbortReason) -> AbortReason {
        let mut winner = reason;
        self.tx.send_if_modified(|current| {
            if let Some(existing) = current {
                winner = *existing;
                false
            } else {
                *current = Some(reason);
                true
            }
        });
        winner
    }

    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        *self.tx.borrow()
    }
}

/// Receiving half of an [`AbortController`], handed to transports.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<AbortReason>>,
}

impl AbortSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        AbortController::new().signal()
    }

    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        *self.rx.borrow()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the controller aborts. Pends forever if the controller is
    /// dropped without aborting.
    pub async fn aborted(&self) -> AbortReason {
        let mut rx = self.rx.clone();
        if let Ok(reason) = rx.wait_for(Option::is_some).await
            && let Some(reason) = *reason
        {
            return reason;
        }
        std::future::pending().await
    }
}
