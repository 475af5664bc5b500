use clap::Parser;

/// Bootstrap configuration for one volume server process. Everything here
/// is a process-start-time decision; runtime state (mounted volumes, the
/// heartbeat's view of the current leader) lives in [`crate::store::Store`]
/// and [`crate::heartbeat`].
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "storage-core volume server")]
pub struct VolumeServerConfig {
    /// `host:port` of every master peer this server may heartbeat to; the
    /// first reachable one is tried first, with the leader hint taking
    /// over on redirect.
    #[arg(long = "master", env = "VOLUME_MASTER_PEERS", value_delimiter = ',', required = true)]
    pub masters: Vec<String>,

    /// One or more data directories, each optionally tagged with a disk
    /// type as `type:path` (defaults to `hdd` when untagged).
    #[arg(long = "dir", env = "VOLUME_DIRS", value_delimiter = ',', required = true)]
    pub dirs: Vec<String>,

    #[arg(long, env = "VOLUME_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: String,

    #[arg(long, env = "VOLUME_GRPC_ADDR", default_value = "0.0.0.0:18080")]
    pub grpc_addr: String,

    /// Address advertised to clients; defaults to `http_addr` when unset
    /// (e.g. behind a load balancer or NAT).
    #[arg(long, env = "VOLUME_PUBLIC_URL")]
    pub public_url: Option<String>,

    #[arg(long, env = "VOLUME_DATA_CENTER", default_value = "dc1")]
    pub data_center: String,

    #[arg(long, env = "VOLUME_RACK", default_value = "rack1")]
    pub rack: String,

    #[arg(long, env = "VOLUME_MAX_VOLUME_COUNT", default_value_t = 7)]
    pub max_volume_count: usize,

    #[arg(long, env = "VOLUME_MIN_FREE_SPACE_BYTES", default_value_t = 1024 * 1024 * 1024)]
    pub min_free_space_bytes: u64,

    #[arg(long, env = "VOLUME_CAPACITY_BYTES", default_value_t = 200 * 1024 * 1024 * 1024)]
    pub capacity_bytes: u64,

    #[arg(long, env = "VOLUME_SIZE_LIMIT_MB", default_value_t = 30_000)]
    pub volume_size_limit_mb: u32,

    #[arg(long, env = "VOLUME_PULSE_SECONDS", default_value_t = 5)]
    pub pulse_seconds: u64,

    #[arg(long, env = "VOLUME_TTL_GRACE_SECONDS", default_value_t = 600)]
    pub ttl_grace_seconds: u64,

    /// HMAC secret used to verify file-id JWTs minted by the master; must
    /// match `MASTER_JWT_SECRET` cluster-wide.
    #[arg(long, env = "VOLUME_JWT_SECRET", default_value = "storagecore-dev-secret")]
    pub jwt_secret: String,

    /// Whether a plain `GET` (no JWT) is rejected; writes always require a
    /// valid JWT regardless of this flag.
    #[arg(long, env = "VOLUME_READ_REQUIRES_JWT", default_value_t = false)]
    pub read_requires_jwt: bool,

    #[arg(long, env = "VOLUME_CONCURRENT_UPLOAD_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub concurrent_upload_bytes: usize,

    #[arg(long, env = "VOLUME_CONCURRENT_DOWNLOAD_BYTES", default_value_t = 128 * 1024 * 1024)]
    pub concurrent_download_bytes: usize,

    #[arg(long, env = "VOLUME_RATE_LIMIT_WAIT_MS", default_value_t = 5_000)]
    pub rate_limit_wait_ms: u64,
}

/// One `--dir` entry after splitting the optional `type:` prefix.
pub struct DirSpec {
    pub disk_type: common::DiskType,
    pub path: std::path::PathBuf,
}

impl VolumeServerConfig {
    pub fn public_url(&self) -> String {
        self.public_url.clone().unwrap_or_else(|| self.http_addr.clone())
    }

    pub fn parsed_dirs(&self) -> Vec<DirSpec> {
        self.dirs
            .iter()
            .map(|entry| match entry.split_once(':') {
                Some((ty, path)) if ty.parse::<common::DiskType>().is_ok() => DirSpec {
                    disk_type: ty.parse().unwrap(),
                    path: path.into(),
                },
                _ => DirSpec {
                    disk_type: common::DiskType::default(),
                    path: entry.into(),
                },
            })
            .collect()
    }
}
