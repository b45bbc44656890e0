use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::notifier::NotificationDispatcher;
use crate::poller::MailPoller;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

const AUTH_FAILURE_NOTICE: &str =
    "❌ Gmail authorization failed. Send /start to re-authorize.";

/// Poller plus dispatcher under one lock so scheduled ticks and manual
/// checks never interleave their API calls.
pub struct Pipeline {
    pub poller: MailPoller,
    pub dispatcher: NotificationDispatcher,
}

pub type SharedPipeline = Arc<Mutex<Pipeline>>;

/// Owns the background polling loop. `arm` is one-shot: the first call
/// spawns the loop, later calls (re-binds, repeated `/start`) are no-ops.
pub struct Scheduler {
    pipeline: SharedPipeline,
    interval: Duration,
    shutdown: CancellationToken,
    armed: AtomicBool,
}

impl Scheduler {
    pub fn new(pipeline: SharedPipeline, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            pipeline,
            interval,
            shutdown,
            armed: AtomicBool::new(false),
        }
    }

    /// Starts the periodic loop unless it is already running.
    pub fn arm(&self) {
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "arming mail poll schedule");
        tokio::spawn(run_schedule(
            self.pipeline.clone(),
            self.interval,
            self.shutdown.clone(),
        ));
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Runs one cycle immediately, serialized against the scheduled loop.
    pub async fn trigger_once(&self) {
        run_cycle(&self.pipeline).await;
    }
}

/// Periodic driver. Cycles are wrapped in `catch_unwind` so a panic in one
/// tick never kills the schedule.
pub async fn run_schedule(
    pipeline: SharedPipeline,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = build_poll_interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("mail poll schedule shutting down");
                break;
            }
            _ = interval.tick() => {
                let result = AssertUnwindSafe(run_cycle(&pipeline)).catch_unwind().await;
                if let Err(panic) = result {
                    let message = if let Some(msg) = panic.downcast_ref::<&str>() {
                        msg.to_string()
                    } else if let Some(msg) = panic.downcast_ref::<String>() {
                        msg.clone()
                    } else {
                        "poll cycle panic".to_string()
                    };
                    error!(error = %message, "poll cycle panicked");
                }
            }
        }
    }
}

/// One poll-and-notify pass. Delivery failures are logged per message and
/// never abort the rest of the batch; authorization failures are surfaced to
/// the bound chat so the user knows to re-run `/start`.
pub async fn run_cycle(pipeline: &SharedPipeline) {
    let mut pipeline = pipeline.lock().await;
    let Pipeline { poller, dispatcher } = &mut *pipeline;

    match poller.poll().await {
        Ok(summaries) => {
            for summary in summaries {
                if let Err(err) = dispatcher.send(&summary).await {
                    error!(message_id = %summary.id, error = %err, "failed to deliver notification");
                }
            }
        }
        Err(err) if err.is_auth() => {
            error!(error = %err, "mail poll failed: authorization");
            if let Err(send_err) = dispatcher.send_text(AUTH_FAILURE_NOTICE).await {
                warn!(error = %send_err, "could not report authorization failure");
            }
        }
        Err(err) => {
            error!(error = %err, "mail poll failed");
        }
    }
}

fn build_poll_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
