use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub bucket: String,
    pub storage_dir: String,
    pub database_url: String,
    pub public_url: String,
    /// `None` means a random secret is generated at startup.
    pub signing_secret: Option<String>,
    pub grant_ttl: Duration,
    pub thumbnail_size: u32,
    pub max_upload_bytes: u64,
    pub request_timeout: Duration,
    pub cascade_preview_delete: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Photo gallery object-storage gateway")]
pub struct Args {
    /// Host to bind to (overrides GALLERY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GALLERY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket holding the gallery (overrides BUCKET_NAME)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Directory where objects are stored (overrides GALLERY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GALLERY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL clients use to redeem access grants (overrides GALLERY_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// HMAC secret for access grants (overrides GALLERY_SIGNING_SECRET)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// Lifetime of issued grants in seconds (overrides GALLERY_GRANT_TTL_SECS)
    #[arg(long)]
    pub grant_ttl_secs: Option<u64>,

    /// Edge length of square previews (overrides GALLERY_THUMBNAIL_SIZE)
    #[arg(long)]
    pub thumbnail_size: Option<u32>,

    /// Largest accepted upload in bytes (overrides GALLERY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Upper bound on one gallery request (overrides GALLERY_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Delete `preview_{key}` together with `key` (overrides GALLERY_CASCADE_PREVIEW_DELETE)
    #[arg(long)]
    pub cascade_preview_delete: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// Merge CLI args over values produced by `lookup` (the environment in
    /// production) over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let host = match args.host {
            Some(host) => host,
            None => lookup("GALLERY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        };
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&lookup, "GALLERY_PORT", 3000)?,
        };
        let bucket = match args.bucket.or_else(|| lookup("BUCKET_NAME").ok()) {
            Some(bucket) if !bucket.trim().is_empty() => bucket,
            _ => bail!("a bucket name is required (--bucket or BUCKET_NAME)"),
        };

        let cfg = Self {
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("GALLERY_STORAGE_DIR").ok())
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("GALLERY_DATABASE_URL").ok())
                .unwrap_or_else(|| "sqlite://./data/meta/gallery.db".into()),
            public_url: args
                .public_url
                .or_else(|| lookup("GALLERY_PUBLIC_URL").ok())
                .unwrap_or_else(|| format!("http://127.0.0.1:{}", port)),
            signing_secret: args
                .signing_secret
                .or_else(|| lookup("GALLERY_SIGNING_SECRET").ok())
                .filter(|s| !s.is_empty()),
            grant_ttl: Duration::from_secs(match args.grant_ttl_secs {
                Some(secs) => secs,
                None => parse_var(&lookup, "GALLERY_GRANT_TTL_SECS", 3600)?,
            }),
            thumbnail_size: match args.thumbnail_size {
                Some(size) => size,
                None => parse_var(&lookup, "GALLERY_THUMBNAIL_SIZE", 100)?,
            },
            max_upload_bytes: match args.max_upload_bytes {
                Some(bytes) => bytes,
                None => parse_var(&lookup, "GALLERY_MAX_UPLOAD_BYTES", 20 * 1024 * 1024)?,
            },
            request_timeout: Duration::from_secs(match args.request_timeout_secs {
                Some(secs) => secs,
                None => parse_var(&lookup, "GALLERY_REQUEST_TIMEOUT_SECS", 300)?,
            }),
            cascade_preview_delete: args.cascade_preview_delete
                || parse_var(&lookup, "GALLERY_CASCADE_PREVIEW_DELETE", false)?,
            host,
            port,
            bucket,
        };

        if cfg.thumbnail_size == 0 {
            bail!("thumbnail size must be at least 1 pixel");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bucket", &self.bucket)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_url", &self.public_url)
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .field("grant_ttl", &self.grant_ttl)
            .field("thumbnail_size", &self.thumbnail_size)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("request_timeout", &self.request_timeout)
            .field("cascade_preview_delete", &self.cascade_preview_delete)
            .finish()
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_when_only_bucket_is_set() {
        let cfg = AppConfig::merge(Args::default(), lookup_from(&[("BUCKET_NAME", "photosky")])).unwrap();
        assert_eq!(cfg.bucket, "photosky");
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.public_url, "http://127.0.0.1:3000");
        assert_eq!(cfg.grant_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.thumbnail_size, 100);
        assert_eq!(cfg.request_timeout, Duration::from_secs(300));
        assert!(cfg.signing_secret.is_none());
        assert!(!cfg.cascade_preview_delete);
    }

    #[test]
    fn args_override_environment() {
        let args = Args {
            port: Some(9000),
            bucket: Some("cli-bucket".into()),
            thumbnail_size: Some(64),
            ..Args::default()
        };
        let cfg = AppConfig::merge(
            args,
            lookup_from(&[
                ("BUCKET_NAME", "env-bucket"),
                ("GALLERY_PORT", "8000"),
                ("GALLERY_THUMBNAIL_SIZE", "32"),
                ("GALLERY_CASCADE_PREVIEW_DELETE", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.bucket, "cli-bucket");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.thumbnail_size, 64);
        assert!(cfg.cascade_preview_delete);
    }

    #[test]
    fn missing_bucket_and_bad_numbers_are_errors() {
        assert!(AppConfig::merge(Args::default(), lookup_from(&[])).is_err());

        let err = AppConfig::merge(
            Args::default(),
            lookup_from(&[("BUCKET_NAME", "photos"), ("GALLERY_PORT", "eighty")]),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("GALLERY_PORT"));

        assert!(
            AppConfig::merge(
                Args::default(),
                lookup_from(&[("BUCKET_NAME", "photos"), ("GALLERY_THUMBNAIL_SIZE", "0")]),
            )
            .is_err()
        );
    }

    #[test]
    fn debug_output_redacts_secret() {
        let cfg = AppConfig::merge(
            Args::default(),
            lookup_from(&[("BUCKET_NAME", "photos"), ("GALLERY_SIGNING_SECRET", "hunter2")]),
        )
        .unwrap();
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
