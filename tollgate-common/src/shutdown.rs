use std::{borrow::Cow, sync::Arc};

use tokio::sync::watch;
use tracing::{debug, info};

/// Why the process is shutting down, e.g. `"SIGTERM"` or
/// `"task 'api-server' finished prematurely"`. Recorded once, at the
/// first trigger; later triggers are ignored.
pub type ShutdownReason = Cow<'static, str>;

/// Coordinates graceful shutdown across the application's tasks.
///
/// - Clone freely; every handle is both a trigger and an observer.
/// - [`trigger`](Self::trigger) requests shutdown. The first call wins and
///   its reason is recorded; later calls are logged and dropped, so every
///   observer agrees on a single cause.
/// - [`wait`](Self::wait) resolves once shutdown has been requested and
///   yields the reason. It can be awaited repeatedly and from any number
///   of handles, including handles created after the trigger.
///
/// Internally a [`watch`] channel holding `Option<ShutdownReason>`. The
/// sender lives inside the handles themselves, so the channel cannot
/// close while any handle is alive.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown, recording `reason` if this is the first request.
    pub fn trigger(&self, reason: impl Into<ShutdownReason>) {
        let reason = reason.into();
        let was_first = self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if was_first {
            info!("Shutdown requested: {reason}");
        } else {
            debug!("Shutdown already in progress; dropping reason: {reason}");
        }
    }

    /// Resolves once shutdown has been requested, yielding the recorded
    /// reason. Safe to await repeatedly.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| state.is_some())
            .await
            .expect("Channel can't close while a handle holds the sender");
        state.clone().expect("Just checked Some in wait_for")
    }

    /// [`wait`](Self::wait), discarding the reason and taking ownership of
    /// the handle. For APIs that require `Future<Output = ()> + 'static`,
    /// e.g. a server's graceful-shutdown hook.
    pub async fn wait_owned(self) {
        let _ = self.wait().await;
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The recorded reason, if shutdown has been requested.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.tx.borrow().clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
