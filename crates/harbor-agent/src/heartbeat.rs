//! Push-based liveness reporting for one registered instance.

use std::sync::Arc;
use std::time::Duration;

use harbor_core::feedback::{self, Feedback, FeedbackSender};
use harbor_core::{CheckStatus, HEARTBEAT_INTERVAL, InstanceHandle, Registry, RegistryError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Must stay well below the registry's check TTL.
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Why a heartbeat loop stopped. A stopped loop is never resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatExit {
    Cancelled,
    /// The first failed report; the instance needs a fresh registration.
    Failed(RegistryError),
}

pub fn spawn_heartbeat<R>(
    registry: Arc<R>,
    handle: InstanceHandle,
    config: HeartbeatConfig,
    token: CancellationToken,
    feedback: Option<FeedbackSender>,
) -> JoinHandle<HeartbeatExit>
where
    R: Registry + ?Sized + 'static,
{
    tokio::spawn(run_heartbeat(registry, handle, config, token, feedback))
}

/// Reports `Passing` once per interval, starting immediately, until `token` is
/// cancelled or a report fails. A failure is emitted once on `feedback` and ends the loop.
pub async fn run_heartbeat<R>(
    registry: Arc<R>,
    handle: InstanceHandle,
    config: HeartbeatConfig,
    token: CancellationToken,
    feedback: Option<FeedbackSender>,
) -> HeartbeatExit
where
    R: Registry + ?Sized,
{
    info!(instance = %handle, interval = ?config.interval, "Heartbeat loop started");
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            report = registry.report_heartbeat(&handle, CheckStatus::Passing) => report,
        };

        match report {
            Ok(()) => {
                metrics::counter!("harbor_heartbeats_total", "outcome" => "ok").increment(1);
                debug!(instance = %handle, "Heartbeat reported");
            }
            Err(err) => {
                metrics::counter!("harbor_heartbeats_total", "outcome" => "error").increment(1);
                warn!(instance = %handle, error = %err, "Heartbeat failed, stopping loop");
                feedback::emit(
                    feedback.as_ref(),
                    Feedback::failure(err.clone(), format!("heartbeat for {handle} failed")),
                );
                return HeartbeatExit::Failed(err);
            }
        }
    }

    info!(instance = %handle, "Heartbeat loop cancelled");
    HeartbeatExit::Cancelled
}
