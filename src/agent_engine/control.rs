use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::{PilotError, PilotResult};

/// Pause and cancel signals shared between a running loop and its owner.
///
/// Cloning yields another handle to the same signals. The loop only
/// suspends through [`RunControl::wait_if_paused`], [`RunControl::guard`]
/// and [`RunControl::sleep`], each of which returns
/// [`PilotError::Cancelled`] as soon as the run is cancelled.
#[derive(Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_modify(|p| *p = true);
    }

    pub fn resume(&self) {
        self.paused.send_modify(|p| *p = false);
    }

    /// Flip the pause flag; returns the new value.
    pub fn toggle_pause(&self) -> bool {
        let mut now = false;
        self.paused.send_modify(|p| {
            *p = !*p;
            now = *p;
        });
        now
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn check(&self) -> PilotResult<()> {
        if self.is_cancelled() {
            Err(PilotError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block while paused. Returns whether the call actually waited.
    pub async fn wait_if_paused(&self) -> PilotResult<bool> {
        self.check()?;
        let mut rx = self.paused.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(false);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PilotError::Cancelled),
            res = rx.wait_for(|paused| !*paused) => {
                res.map_err(|_| PilotError::Agent("pause signal dropped".into()))?;
                Ok(true)
            }
        }
    }

    /// Run `fut` unless the run is cancelled first.
    pub async fn guard<F: Future>(&self, fut: F) -> PilotResult<F::Output> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PilotError::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> PilotResult<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}
