use std::sync::Arc;

use common::JwtSigner;
use master_client::MasterClient;

use crate::config::VolumeServerConfig;
use crate::rate_limit::ByteRateLimiter;
use crate::store::Store;

/// Everything one volume server process holds in memory: the locally
/// mounted volumes, the shared client-side view of the master cluster used
/// both to answer redirects and to discover replica peers for fan-out
/// writes, and the two byte-budget admission gates from §5.
pub struct VolumeServerState {
    pub config: VolumeServerConfig,
    pub store: Store,
    pub master_client: Arc<MasterClient>,
    pub jwt: JwtSigner,
    pub upload_limiter: ByteRateLimiter,
    pub download_limiter: ByteRateLimiter,
    pub http_client: reqwest::Client,
}
