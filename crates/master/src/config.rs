use clap::Parser;

/// Bootstrap configuration for one master process. Everything here is a
/// process-start-time decision; nothing in this struct changes at
/// runtime (runtime state lives in [`crate::state::MasterState`]).
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "storage-core master node")]
pub struct MasterConfig {
    /// This node's raft id; must be unique and stable across restarts.
    #[arg(long, env = "MASTER_RAFT_ID")]
    pub raft_id: u64,

    /// `raft_id=host:port` of every voter, including this node.
    #[arg(long = "peer", env = "MASTER_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    #[arg(long, env = "MASTER_HTTP_ADDR", default_value = "0.0.0.0:9333")]
    pub http_addr: String,

    #[arg(long, env = "MASTER_GRPC_ADDR", default_value = "0.0.0.0:19333")]
    pub grpc_addr: String,

    #[arg(long, env = "MASTER_VOLUME_SIZE_LIMIT_MB", default_value_t = 30_000)]
    pub volume_size_limit_mb: u32,

    #[arg(long, env = "MASTER_DEFAULT_REPLICATION", default_value = "000")]
    pub default_replication: String,

    #[arg(long, env = "MASTER_PULSE_SECONDS", default_value_t = 5)]
    pub pulse_seconds: u64,

    #[arg(long, env = "MASTER_VACUUM_INTERVAL_SECONDS", default_value_t = 3600)]
    pub vacuum_interval_seconds: u64,

    #[arg(long, env = "MASTER_VACUUM_GARBAGE_THRESHOLD", default_value_t = 0.3)]
    pub vacuum_garbage_threshold: f64,

    #[arg(long, env = "MASTER_GROWER_QUEUE_CAPACITY", default_value_t = 128)]
    pub grower_queue_capacity: usize,

    /// Fraction of the volume size limit below which a layout's writable
    /// set is considered low on free space and a grow is requested (§4.3
    /// step 2).
    #[arg(long, env = "MASTER_GROW_FREE_FRACTION", default_value_t = 0.1)]
    pub grow_free_fraction: f64,

    /// HMAC secret used to sign file-id JWTs; every master in a cluster
    /// must share this so a token minted by one leader verifies on
    /// whichever volume server serves the read.
    #[arg(long, env = "MASTER_JWT_SECRET", default_value = "storagecore-dev-secret")]
    pub jwt_secret: String,

    #[arg(long, env = "MASTER_WRITE_JWT_TTL_SECONDS", default_value_t = 60)]
    pub write_jwt_ttl_seconds: u64,

    #[arg(long, env = "MASTER_READ_JWT_TTL_SECONDS", default_value_t = 300)]
    pub read_jwt_ttl_seconds: u64,
}

impl MasterConfig {
    /// Parses `raft_id=host:port` peer entries into `(id, address)` pairs,
    /// skipping malformed entries with a warning rather than failing
    /// startup over one typo in a long peer list.
    pub fn parsed_peers(&self) -> Vec<(u64, String)> {
        self.peers
            .iter()
            .filter_map(|entry| {
                let (id, addr) = entry.split_once('=')?;
                let id: u64 = id.parse().ok()?;
                Some((id, addr.to_string()))
            })
            .collect()
    }

    pub fn voter_ids(&self) -> Vec<u64> {
        self.parsed_peers().into_iter().map(|(id, _)| id).collect()
    }
}
