//! Periodic discovery timer.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::controller::Controller;

/// Sweep the seeds after `initial_delay`, then every `interval`, until
/// `shutdown` flips or the controller is dropped.
pub(crate) async fn run(
    controller: Weak<Controller>,
    initial_delay: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(controller) = controller.upgrade() else { break };
                let Some(root) = controller.root() else { break };
                controller.sweep(&root);
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("discovery timer stopped");
}
