use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use domu_auth::SessionManager;
use domu_db::Database;
use domu_gateway::Dispatcher;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Dispatcher,
    pub config: ApiConfig,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Uploads land in `<public_dir>/uploads/...`
    pub public_dir: PathBuf,
    /// Mark the session cookie `Secure` (production only)
    pub secure_cookies: bool,
}

impl AppStateInner {
    /// Run blocking storage or hashing work off the async runtime.
    pub async fn blocking<F, T>(self: &Arc<Self>, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&AppStateInner) -> Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ApiError::Internal(anyhow::anyhow!("background task failed"))
            })?
    }
}
