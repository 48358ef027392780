//! Checkpoint/restart hooks.

use super::Transport;
use crate::error::{Result, RmlError};
use std::sync::Arc;

/// Fault-tolerance signal from the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtState {
    /// A checkpoint is about to be taken.
    Checkpoint,
    /// Execution continues after a checkpoint.
    Continue,
    /// The process was restarted from a checkpoint.
    Restart,
    /// The job is terminating.
    Term,
}

/// The host runtime's own state machine, told about checkpoint transitions.
pub trait FtObserver: Send + Sync {
    fn on_ft_event(&self, state: FtState);
}

impl<F> FtObserver for F
where
    F: Fn(FtState) + Send + Sync,
{
    fn on_ft_event(&self, state: FtState) {
        self(state)
    }
}

impl Transport {
    pub fn set_ft_observer(&self, observer: Option<Arc<dyn FtObserver>>) -> Result<()> {
        *self
            .ft_observer
            .lock()
            .map_err(|_| RmlError::LockPoisoned("ft observer"))? = observer;
        Ok(())
    }

    /// Handle a fault-tolerance event.
    ///
    /// Checkpoint and continue are forwarded to the observer and need nothing
    /// from the transport. Restart is forwarded, then closes and reopens every
    /// fabric resource. Term is ignored.
    pub fn ft_event(&self, state: FtState) -> Result<()> {
        match state {
            FtState::Checkpoint | FtState::Continue => {
                tracing::info!(rank = %self.me, ?state, "fault tolerance event");
                self.notify_ft(state)
            }
            FtState::Restart => {
                tracing::info!(rank = %self.me, "restart requested, reopening fabric resources");
                self.notify_ft(state)?;
                self.restart()
            }
            FtState::Term => Ok(()),
        }
    }

    /// Close and reopen all fabric resources.
    ///
    /// Pending operations complete with `Shutdown`. Peer contacts and exception
    /// handlers survive; cached fabric addresses and channels do not. The local
    /// endpoint address changes, so peers need the new URI.
    pub fn restart(&self) -> Result<()> {
        let preserved = self.teardown(true)?;
        self.bring_up(preserved)?;
        Ok(())
    }

    fn notify_ft(&self, state: FtState) -> Result<()> {
        let observer = self
            .ft_observer
            .lock()
            .map_err(|_| RmlError::LockPoisoned("ft observer"))?
            .clone();
        if let Some(observer) = observer {
            observer.on_ft_event(state);
        }
        Ok(())
    }
}
