//! HTTP 层共享状态

use edge_ingest::ConnectionState;
use edge_storage::LocalBuffer;
use edge_upload::UploadCoordinator;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// 单个资产的连接状态订阅。
#[derive(Clone)]
pub struct AssetHandle {
    pub asset_name: String,
    pub state: watch::Receiver<ConnectionState>,
}

impl AssetHandle {
    pub fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub enterprise: String,
    pub started_at: Instant,
    pub assets: Arc<Vec<AssetHandle>>,
    pub buffer: Arc<dyn LocalBuffer>,
    pub upload: Arc<UploadCoordinator>,
}
