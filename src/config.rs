use crate::{
    registry::postgres::PgSettings, services::sync_service::SyncSettings,
    storage::s3::S3Settings,
};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};
use thiserror::Error;

const ENV_PREFIX: &str = "FILE_DROP_";
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration `{0}`")]
    Missing(String),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

/// Where uploaded blobs are kept.
#[derive(Clone)]
pub enum StorageConfig {
    S3(S3Settings),
    Local { root: String, bucket: String },
}

/// Which relational database backs the file registry.
#[derive(Clone)]
pub enum DatabaseConfig {
    Postgres(PgSettings),
    Sqlite { url: String },
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub sync: SyncSettings,
    pub op_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Unpack uploaded `.zip` archives into their entries.
    pub unpack_archives: bool,
    pub max_unpacked_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Archive upload service with a file metadata registry")]
pub struct Args {
    /// Host to bind to (overrides FILE_DROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_DROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for the local storage backend (overrides FILE_DROP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// SQLite database URL (overrides FILE_DROP_SQLITE_URL)
    #[arg(long)]
    pub sqlite_url: Option<String>,

    /// Apply the registry schema and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Reads prefixed keys through a lookup function; empty values count as unset.
struct Source<F> {
    lookup: F,
}

fn prefixed(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&prefixed(name)).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::Missing(prefixed(name)))
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(name)
            .map(|value| {
                value.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
                    key: prefixed(name),
                    reason: format!("`{value}`: {err}"),
                })
            })
            .transpose()
    }

    fn millis(&self, name: &str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(
            self.parsed::<u64>(name)?.unwrap_or(default),
        ))
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool), ConfigError> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values from `lookup`.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let src = Source { lookup };

        let host = args
            .host
            .or_else(|| src.get("HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => src
                .parsed::<u16>("PORT")?
                .ok_or_else(|| ConfigError::Missing(prefixed("PORT")))?,
        };

        let bucket = src.required("BUCKET")?;
        ensure_bucket_name_safe(&bucket).map_err(|reason| ConfigError::Invalid {
            key: prefixed("BUCKET"),
            reason,
        })?;

        let backend = src.get("STORAGE_BACKEND").unwrap_or_else(|| "s3".into());
        let storage = match backend.to_ascii_lowercase().as_str() {
            "s3" => StorageConfig::S3(S3Settings {
                bucket,
                region: src.required("S3_REGION")?,
                endpoint: src.get("S3_ENDPOINT"),
                access_key_id: src.required("S3_ACCESS_KEY_ID")?,
                secret_access_key: src.required("S3_SECRET_ACCESS_KEY")?,
            }),
            "local" => StorageConfig::Local {
                root: args
                    .storage_dir
                    .or_else(|| src.get("STORAGE_DIR"))
                    .unwrap_or_else(|| "./data/objects".into()),
                bucket,
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: prefixed("STORAGE_BACKEND"),
                    reason: format!("`{other}` is not one of `s3`, `local`"),
                });
            }
        };

        let db_backend = src.get("DB_BACKEND").unwrap_or_else(|| "postgres".into());
        let database = match db_backend.to_ascii_lowercase().as_str() {
            "postgres" => DatabaseConfig::Postgres(PgSettings {
                host: src.required("DB_HOST")?,
                port: src
                    .parsed::<u16>("DB_PORT")?
                    .ok_or_else(|| ConfigError::Missing(prefixed("DB_PORT")))?,
                user: src.required("DB_USER")?,
                password: src.required("DB_PASSWORD")?,
                database: src.required("DB_NAME")?,
            }),
            "sqlite" => DatabaseConfig::Sqlite {
                url: args
                    .sqlite_url
                    .or_else(|| src.get("SQLITE_URL"))
                    .unwrap_or_else(|| "sqlite://./data/meta/files.db".into()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: prefixed("DB_BACKEND"),
                    reason: format!("`{other}` is not one of `postgres`, `sqlite`"),
                });
            }
        };

        let op_timeout = src.millis("OP_TIMEOUT_MS", 30_000)?;
        if op_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: prefixed("OP_TIMEOUT_MS"),
                reason: "must be greater than zero".into(),
            });
        }
        let sync = SyncSettings {
            settle_delay: src.millis("SYNC_SETTLE_MS", 5_000)?,
            poll_interval: src.millis("SYNC_POLL_MS", 500)?,
            max_attempts: src.parsed::<u32>("SYNC_MAX_ATTEMPTS")?.unwrap_or(10).max(1),
            op_timeout,
        };
        let max_upload_bytes = src
            .parsed::<usize>("MAX_UPLOAD_BYTES")?
            .unwrap_or(100 * 1024 * 1024);
        let unpack_archives = src.parsed::<bool>("UNPACK_ARCHIVES")?.unwrap_or(true);
        let max_unpacked_bytes = src
            .parsed::<u64>("MAX_UNPACKED_BYTES")?
            .unwrap_or(1024 * 1024 * 1024);

        Ok(Self {
            host,
            port,
            storage,
            database,
            sync,
            op_timeout,
            max_upload_bytes,
            unpack_archives,
            max_unpacked_bytes,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageConfig::S3(s3) => f
                .debug_struct("S3")
                .field("bucket", &s3.bucket)
                .field("region", &s3.region)
                .field("endpoint", &s3.endpoint)
                .field("access_key_id", &s3.access_key_id)
                .field("secret_access_key", &"<redacted>")
                .finish(),
            StorageConfig::Local { root, bucket } => f
                .debug_struct("Local")
                .field("root", root)
                .field("bucket", bucket)
                .finish(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseConfig::Postgres(pg) => f
                .debug_struct("Postgres")
                .field("host", &pg.host)
                .field("port", &pg.port)
                .field("user", &pg.user)
                .field("password", &"<redacted>")
                .field("database", &pg.database)
                .finish(),
            DatabaseConfig::Sqlite { url } => {
                f.debug_struct("Sqlite").field("url", url).finish()
            }
        }
    }
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn ensure_bucket_name_safe(name: &str) -> Result<(), String> {
    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err("must be between 3 and 63 characters".into());
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(
            "allowed characters are lowercase letters, digits, dots, and hyphens".into(),
        );
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err("must start and end with a lowercase letter or digit".into());
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err("cannot contain consecutive dots or dot-hyphen combinations".into());
    }
    if is_ipv4_like(name) {
        return Err("must not be formatted like an IP address".into());
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
