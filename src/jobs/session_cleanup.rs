use std::time::{Duration, Instant};

use crate::services::{SessionError, SessionService};

/// Outcome of a single cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupResult {
    pub sessions_deleted: u64,
    pub duration_ms: u64,
}

/// Delete every expired session once.
pub async fn run_session_cleanup(sessions: &SessionService) -> Result<CleanupResult, SessionError> {
    let start = Instant::now();
    let sessions_deleted = sessions.cleanup_expired().await?;
    Ok(CleanupResult {
        sessions_deleted,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// Starts the session cleanup worker as a background task.
///
/// Runs until the task is cancelled. A failed pass is logged and retried at
/// the next tick.
pub async fn start_session_cleanup_worker(sessions: SessionService, interval: Duration) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        "Starting session cleanup worker"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match run_session_cleanup(&sessions).await {
            Ok(result) if result.sessions_deleted > 0 => {
                tracing::info!(
                    sessions = result.sessions_deleted,
                    duration_ms = result.duration_ms,
                    "Session cleanup run complete"
                );
            }
            Ok(_) => {
                tracing::debug!("Session cleanup run complete, nothing to clean up");
            }
            Err(e) => {
                tracing::error!(error = %e, "Error running session cleanup");
            }
        }
    }
}
