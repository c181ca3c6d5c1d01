//! Health monitor: a single supervisory task enforcing the four timeouts.
//!
//! Each sweep holds one registry lock at a time, briefly. The monitor never
//! frees anything itself — it nudges execution state and retires silent
//! clients; actual cleanup follows from the refcount and activity-counter
//! invariants.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::execution::ExecutionState;
use crate::server::ServerInner;

pub(crate) async fn run(server: Arc<ServerInner>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(
        server.config.health_check_interval_ms,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep_executions(&server);
        server
            .clients
            .sweep_idle(Duration::from_millis(server.config.client_timeout_ms));
    }
}

fn sweep_executions(server: &ServerInner) {
    let now = Instant::now();
    let exec_timeout = Duration::from_millis(server.config.tool_exec_timeout_ms);
    let idle_timeout = Duration::from_millis(server.config.tool_idle_timeout_ms);
    let cancel_timeout = Duration::from_millis(server.config.tool_cancel_timeout_ms);

    server.executions.for_each(|exec| match exec.state {
        ExecutionState::Cancelled => {
            let overdue = exec
                .cancelled_at
                .is_some_and(|at| now.saturating_duration_since(at) > cancel_timeout);
            if overdue {
                // The callback is misbehaving: it neither acknowledged the
                // cancellation nor produced a response. Forcible reclaim is
                // a host policy decision, so the monitor only reports.
                error!(
                    token = %exec.token,
                    client = exec.client.index(),
                    worker = exec.worker_id,
                    tool = %exec.tool_name,
                    "execution exceeded cancellation timeout without acknowledgement"
                );
            }
        }
        ExecutionState::Finished => {}
        ExecutionState::Active => {
            if now.saturating_duration_since(exec.started) > exec_timeout {
                warn!(
                    token = %exec.token,
                    client = exec.client.index(),
                    worker = exec.worker_id,
                    "execution exceeded execution timeout, cancelling"
                );
                exec.state = ExecutionState::Cancelled;
                exec.cancelled_at = Some(now);
            } else if now.saturating_duration_since(exec.last_message) > idle_timeout {
                warn!(
                    token = %exec.token,
                    client = exec.client.index(),
                    worker = exec.worker_id,
                    "execution exceeded idle timeout, cancelling"
                );
                exec.state = ExecutionState::Cancelled;
                exec.cancelled_at = Some(now);
            }
        }
    });
}
