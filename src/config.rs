use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Default nominal chunk size (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;
/// Default per-file size limit (25 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;
/// Default whole-request body limit (100 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 100 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub max_request_size: usize,
    pub admin_token: Option<String>,
    pub session_ttl: Duration,
    pub sweep_after: Duration,
}

// Hand-written so the admin token never reaches the logs.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("chunk_size", &self.chunk_size)
            .field("max_file_size", &self.max_file_size)
            .field("max_request_size", &self.max_request_size)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("session_ttl", &self.session_ttl)
            .field("sweep_after", &self.sweep_after)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Proof-of-payment submission vault")]
pub struct Args {
    /// Host to bind to (overrides POA_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides POA_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides POA_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Nominal chunk size in bytes (overrides POA_VAULT_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Per-file size limit in bytes (overrides POA_VAULT_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Whole-request body limit in bytes (overrides POA_VAULT_MAX_REQUEST_SIZE)
    #[arg(long)]
    pub max_request_size: Option<usize>,

    /// Admin session lifetime in seconds (overrides POA_VAULT_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Age in seconds after which unfinished uploads are swept at startup
    /// (overrides POA_VAULT_SWEEP_AFTER_SECS)
    #[arg(long)]
    pub sweep_after_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    ///
    /// The admin token is only read from `POA_VAULT_ADMIN_TOKEN` so it does
    /// not show up in process listings.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("POA_VAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("POA_VAULT_PORT", 8000u16)?;
        let env_db = env::var("POA_VAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/poa_vault.db".into());
        let env_chunk = env_parse("POA_VAULT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let env_max_file = env_parse("POA_VAULT_MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?;
        let env_max_request = env_parse("POA_VAULT_MAX_REQUEST_SIZE", DEFAULT_MAX_REQUEST_SIZE)?;
        let env_ttl = env_parse("POA_VAULT_SESSION_TTL_SECS", 8 * 60 * 60u64)?;
        let env_sweep = env_parse("POA_VAULT_SWEEP_AFTER_SECS", 60 * 60u64)?;
        let admin_token = env::var("POA_VAULT_ADMIN_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            max_file_size: args.max_file_size.unwrap_or(env_max_file),
            max_request_size: args.max_request_size.unwrap_or(env_max_request),
            admin_token,
            session_ttl: Duration::from_secs(args.session_ttl_secs.unwrap_or(env_ttl)),
            sweep_after: Duration::from_secs(args.sweep_after_secs.unwrap_or(env_sweep)),
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    /// Reject size settings the chunk store cannot represent.
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        let max_chunks = self.max_file_size.div_ceil(self.chunk_size as u64);
        if max_chunks > u64::from(u32::MAX) {
            anyhow::bail!(
                "max file size {} needs {} chunks of {} bytes, more than {} allowed",
                self.max_file_size,
                max_chunks,
                self.chunk_size,
                u32::MAX
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
