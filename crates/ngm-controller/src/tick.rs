//! Per-tick error aggregation and the guarded tick loop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome of one tick of a control loop.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Strategies or tasks looked at.
    pub processed: usize,
    /// `(subject, error)` for every failure the tick stepped over.
    pub errors: Vec<(String, String)>,
}

impl TickReport {
    pub fn record_error(&mut self, subject: impl Into<String>, error: impl std::fmt::Display) {
        self.errors.push((subject.into(), error.to_string()));
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn log(&self, control_loop: &str) {
        if self.is_clean() {
            debug!(control_loop, processed = self.processed, "tick completed");
        } else {
            warn!(
                control_loop,
                processed = self.processed,
                failures = self.errors.len(),
                "tick completed with errors"
            );
        }
    }
}

/// Call `tick` every `interval` until `shutdown` flips.
///
/// Each tick runs in its own task, so a panic is logged and the loop keeps
/// going. A tick in progress is never cancelled.
pub(crate) async fn run_ticks<F, Fut>(
    control_loop: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = TickReport> + Send + 'static,
{
    info!(control_loop, interval_secs = interval.as_secs(), "control loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tokio::spawn(tick()).await {
                    Ok(report) => report.log(control_loop),
                    Err(e) if e.is_panic() => error!(control_loop, "tick panicked"),
                    Err(e) => error!(control_loop, error = %e, "tick aborted"),
                }
            }
            _ = shutdown.changed() => {
                info!(control_loop, "control loop shutting down");
                break;
            }
        }
    }
}
