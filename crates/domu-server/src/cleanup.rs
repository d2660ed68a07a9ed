use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use domu_auth::SessionManager;

/// Deletes expired session rows on an interval. Expired tokens are already
/// rejected at verification time; this only keeps the table small.
pub async fn run_session_prune_loop(sessions: Arc<SessionManager>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let sessions = sessions.clone();
        match tokio::task::spawn_blocking(move || sessions.prune_expired(Utc::now())).await {
            Ok(Ok(count)) => {
                if count > 0 {
                    info!("Cleanup: pruned {} expired sessions", count);
                }
            }
            Ok(Err(e)) => warn!("Session cleanup error: {}", e),
            Err(e) => warn!("Session cleanup task failed: {}", e),
        }
    }
}
