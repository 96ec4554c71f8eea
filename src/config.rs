use clap::{Parser, ValueEnum};

/// Where projects are persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// S3 bucket given by `--bucket`
    S3,
    /// Process memory, lost on restart
    Memory,
}

/// Server configuration, from flags or environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "flashdash")]
#[command(about = "Upload tables, run snippets against them and save the result as projects")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "FLASHDASH_BIND", default_value = "127.0.0.1:3000")]
    pub bind: String,

    /// AWS region of the project bucket
    #[arg(long, env = "AWS_REGION", default_value = "us-east-2")]
    pub region: String,

    /// Bucket holding project archives and index records
    #[arg(long, env = "VIZ_BUCKET", default_value = "csv-visualizer-sunderdev")]
    pub bucket: String,

    /// Project storage backend
    #[arg(long, value_enum, env = "FLASHDASH_STORAGE", default_value = "s3")]
    pub storage: StorageKind,

    /// Request header carrying the identity set by the auth proxy
    #[arg(long, env = "FLASHDASH_AUTH_HEADER", default_value = "X-Auth-Request-Email")]
    pub auth_header: String,

    /// Operation ceiling for one snippet run (0 = unlimited)
    #[arg(long, env = "FLASHDASH_MAX_OPERATIONS", default_value = "50000000")]
    pub max_operations: u64,

    /// Days until a newly saved project expires
    #[arg(long, env = "FLASHDASH_EXPIRY_DAYS", default_value = "90")]
    pub expiry_days: i64,

    /// Largest accepted upload request, in MiB
    #[arg(long, env = "FLASHDASH_MAX_UPLOAD_MB", default_value = "200")]
    pub max_upload_mb: usize,

    /// Minutes after which an unused workspace is dropped
    #[arg(long, env = "FLASHDASH_WORKSPACE_IDLE_MINUTES", default_value = "120")]
    pub workspace_idle_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:3000".to_string(),
            region: "us-east-2".to_string(),
            bucket: "csv-visualizer-sunderdev".to_string(),
            storage: StorageKind::Memory,
            auth_header: "X-Auth-Request-Email".to_string(),
            max_operations: 50_000_000,
            expiry_days: crate::expiry::DEFAULT_EXPIRY_DAYS,
            max_upload_mb: 200,
            workspace_idle_minutes: 120,
        }
    }
}
