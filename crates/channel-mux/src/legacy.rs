//! Per-feature socket that predates the multiplexer.
//!
//! Each mount loads its data over REST, then keeps a dedicated WebSocket open
//! purely as an invalidation signal: every inbound frame triggers another REST
//! fetch. Reconnects follow the same [`ReconnectPolicy`] as the manager, with
//! a fixed delay and an attempt counter that callers may share across mounts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::policy::ReconnectPolicy;
use crate::types::{BoxError, Error};

/// A future returned by the caller's REST fetch function.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Caller-supplied REST fetch. Populates the caller's own state.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

pub struct LegacySocketConfig {
    pub url: Url,
    pub fetch: FetchFn,
    pub policy: ReconnectPolicy,
    /// Reconnects spent so far. Share one counter between mounts to give
    /// them a common budget.
    pub attempts: Arc<AtomicU32>,
}

impl LegacySocketConfig {
    pub fn new(url: Url, fetch: FetchFn, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            url,
            fetch,
            policy: ReconnectPolicy::fixed(max_attempts, retry_delay),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// A mounted per-feature socket. Dropping it tears the mount down.
pub struct LegacyFeatureSocket {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LegacyFeatureSocket {
    /// Start the initial fetch and the socket loop on the current runtime.
    pub fn mount(config: LegacySocketConfig) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_mount(config, cancel.clone()));
        Ok(Self { cancel, task })
    }

    /// Cancel any pending reconnect and close the transport.
    pub fn unmount(self) {
        self.cancel.cancel();
    }

    /// True once the mount stopped on its own (retries exhausted) or was
    /// torn down.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LegacyFeatureSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn refetch(fetch: &FetchFn, reason: &str) {
    if let Err(e) = fetch().await {
        tracing::warn!(reason, "REST fetch failed: {e}");
    }
}

async fn run_mount(config: LegacySocketConfig, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = refetch(&config.fetch, "initial load") => {}
    }

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = tokio_tungstenite::connect_async(config.url.as_str()) => opened,
        };
        match opened {
            Ok((mut ws, _resp)) => {
                tracing::info!(url = %config.url, "feature socket open");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        frame = ws.next() => match frame {
                            Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => {
                                        let _ = ws.close(None).await;
                                        return;
                                    }
                                    _ = refetch(&config.fetch, "invalidation") => {}
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("feature socket error: {e}");
                                let _ = ws.close(None).await;
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                tracing::warn!(url = %config.url, "feature socket connect failed: {e}");
            }
        }

        // Check and spend in one step; mounts may share the counter.
        let claimed = config
            .attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |spent| {
                config.policy.retry_after(spent).map(|_| spent + 1)
            });
        let consumed = match claimed {
            Ok(spent) => spent,
            Err(spent) => {
                tracing::info!(
                    attempts = spent,
                    "feature socket closed, reconnect budget spent"
                );
                return;
            }
        };
        let delay = config.policy.backoff.delay_for_attempt(consumed);
        tracing::info!(
            attempt = consumed + 1,
            delay_ms = delay.as_millis() as u64,
            "feature socket closed, reconnecting"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
