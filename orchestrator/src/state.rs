use std::sync::Arc;

use crate::auth::AuthGate;
use crate::cache::Cache;
use crate::config::Config;
use crate::container::ContainerManager;
use crate::db::Db;
use crate::quota::QuotaManager;
use crate::rpc::RpcHub;
use crate::sandbox::SandboxManager;

pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub cache: Cache,
    pub containers: ContainerManager,
    pub auth: AuthGate,
    pub quota: QuotaManager,
    pub hub: Arc<RpcHub>,
    pub sandboxes: SandboxManager,
}
