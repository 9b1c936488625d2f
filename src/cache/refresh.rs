//! Background refresh of cached results.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::store::CacheState;
use crate::execution::CommandResult;

/// Smallest accepted refresh period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Produces a fresh result for a cached command.
///
/// Returning `None` keeps the cached entry unchanged.
#[async_trait]
pub trait CacheRefresher: Send + Sync {
    async fn refresh(&self, id: &str, command: &str) -> Option<CommandResult>;
}

/// Handle to the running refresh task.
pub(crate) struct RefreshTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    pub(crate) fn spawn(
        state: Arc<RwLock<CacheState>>,
        period: Duration,
        refresher: Arc<dyn CacheRefresher>,
    ) -> Self {
        let token = CancellationToken::new();
        let period = period.max(MIN_INTERVAL);
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    refreshed = refresh_once(&state, refresher.as_ref()) => {
                        debug!(refreshed, "cache refresh pass complete");
                    }
                }
            }
            debug!("cache refresh task exiting");
        });

        info!(interval = ?period, "cache refresh started");
        Self { token, handle }
    }

    /// Signal the task and wait until it has exited.
    pub(crate) async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            debug!(error = %e, "cache refresh task ended abnormally");
        }
        info!("cache refresh stopped");
    }

    /// Signal the task without waiting.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

/// One refresh pass. Returns how many entries were replaced.
async fn refresh_once(state: &RwLock<CacheState>, refresher: &dyn CacheRefresher) -> usize {
    let targets = match state.read() {
        Ok(state) => state.commands(),
        Err(_) => return 0,
    };

    let mut replaced = 0;
    for (id, command) in targets {
        let Some(result) = refresher.refresh(&id, &command).await else {
            continue;
        };
        if let Ok(mut state) = state.write() {
            if state.replace(&id, result) {
                replaced += 1;
            }
        }
    }
    replaced
}
