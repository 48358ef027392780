//! Tokio integration: background progress and awaitable operations.

use crate::error::{Result, RmlError};
use crate::transport::Transport;
use crate::types::{PeerMatch, ProcessName, RecvCompletion, SendCompletion, Tag};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Background task calling [`Transport::progress`] on a fixed interval.
///
/// The task is aborted when the driver is dropped.
pub struct ProgressDriver {
    handle: Option<JoinHandle<()>>,
}

impl ProgressDriver {
    /// Spawn the progress loop on the current tokio runtime.
    pub fn spawn(transport: Arc<Transport>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_micros(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match transport.progress() {
                    Ok(_) => {}
                    // between finalize and a later initialize
                    Err(RmlError::NotInitialized) => {}
                    Err(e) => {
                        tracing::warn!(rank = %transport.me(), error = %e, "progress failed");
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Stop the loop and wait for the task to wind down.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressDriver {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Transport {
    /// Post a send whose completion is delivered through a oneshot channel.
    ///
    /// Something must keep calling `progress()` (for example a [`ProgressDriver`]).
    pub fn send_awaitable(
        &self,
        peer: ProcessName,
        buf: Vec<u8>,
        tag: Tag,
    ) -> Result<oneshot::Receiver<SendCompletion>> {
        let (tx, rx) = oneshot::channel();
        self.send_buffer(
            peer,
            buf,
            tag,
            Box::new(move |c| {
                let _ = tx.send(c);
            }),
        )?;
        Ok(rx)
    }

    /// Post a one-shot receive whose completion is delivered through a oneshot channel.
    pub fn recv_awaitable(
        &self,
        peer: PeerMatch,
        tag: Tag,
    ) -> Result<oneshot::Receiver<RecvCompletion>> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.receive(
            peer,
            tag,
            false,
            Box::new(move |c| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(c);
                }
            }),
        )?;
        Ok(rx)
    }

    /// Async form of [`Transport::ping`]: drives progress between short sleeps
    /// instead of blocking the thread.
    pub async fn ping_async(&self, uri: &str, timeout: Duration) -> Result<bool> {
        let (tx, mut rx) = oneshot::channel();
        let key = self.post_probe(
            uri,
            timeout,
            Box::new(move |c| {
                let _ = tx.send(c.status.is_success());
            }),
        )?;
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            self.progress()?;
            match rx.try_recv() {
                Ok(reachable) => return Ok(reachable),
                Err(TryRecvError::Closed) => return Ok(false),
                Err(TryRecvError::Empty) => {}
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                self.abandon(key)?;
                tracing::debug!(uri, "ping timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.config().ping_poll_interval).await;
        }
    }
}
