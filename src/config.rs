//! Process Configuration
//!
//! Settings shared by every workflow in the process, read from `INGEST_*`
//! environment variables and optionally overridden on the command line.
//!
//! | Variable           | Meaning                                 | Default                    |
//! |--------------------|-----------------------------------------|----------------------------|
//! | `INGEST_HOME`      | local working directory (`{work_dir}`)  | `/opt/ingest`              |
//! | `INGEST_BUCKET`    | target bucket id (`{bucket}`)           | required                   |
//! | `INGEST_STORE`     | `local:<dir>` or `gcs`                  | `local:<INGEST_HOME>/store`|
//! | `INGEST_CONVERTER` | converter command with `{src}`/`{dest}` | built-in encoder           |
//! | `INGEST_TICK_SECS` | seconds between scheduler ticks         | `30`                       |
//! | `INGEST_WORKERS`   | concurrent task actions                 | CPU count                  |

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::ConfigError;

/// Default local working directory.
pub static DEFAULT_HOME: Lazy<PathBuf> = Lazy::new(|| PathBuf::from("/opt/ingest"));

/// Default worker count.
pub static DEFAULT_WORKERS: Lazy<usize> = Lazy::new(num_cpus::get);

pub const DEFAULT_TICK_SECS: u64 = 30;

/// Where published objects go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Objects are files under `<root>/<bucket>/<key>`.
    Local(PathBuf),
    /// Objects are uploaded with `gsutil cp` to `gs://<bucket>/<key>`.
    Gcs,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("gcs") {
            return Ok(StoreBackend::Gcs);
        }
        match s.strip_prefix("local:") {
            Some(dir) if !dir.trim().is_empty() => Ok(StoreBackend::Local(PathBuf::from(dir.trim()))),
            _ => Err(format!("expected 'local:<dir>' or 'gcs', got '{}'", s)),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Local(root) => write!(f, "local:{}", root.display()),
            StoreBackend::Gcs => write!(f, "gcs"),
        }
    }
}

/// Values supplied on the command line. They take precedence over the
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub work_dir: Option<PathBuf>,
    pub bucket: Option<String>,
    pub workers: Option<usize>,
    pub tick_secs: Option<u64>,
}

/// Resolved process settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub work_dir: PathBuf,
    pub bucket: String,
    pub store: StoreBackend,
    pub converter: Option<String>,
    pub tick: Duration,
    pub workers: usize,
}

impl ProcessConfig {
    /// Reads the process environment.
    pub fn from_env(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), overrides)
    }

    /// Builds a configuration from any variable source.
    pub fn from_lookup<F>(lookup: F, overrides: &ConfigOverrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let work_dir = overrides
            .work_dir
            .clone()
            .or_else(|| get("INGEST_HOME").map(PathBuf::from))
            .unwrap_or_else(|| DEFAULT_HOME.clone());

        let bucket = overrides
            .bucket
            .clone()
            .or_else(|| get("INGEST_BUCKET"))
            .map(|b| b.trim().to_string())
            .ok_or(ConfigError::MissingEnv("INGEST_BUCKET"))?;

        let store = match get("INGEST_STORE") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "INGEST_STORE",
                value,
            })?,
            None => StoreBackend::Local(work_dir.join("store")),
        };

        let converter = get("INGEST_CONVERTER");

        let tick_secs = match overrides.tick_secs {
            Some(secs) => secs,
            None => parse_number(get("INGEST_TICK_SECS"), "INGEST_TICK_SECS", DEFAULT_TICK_SECS)?,
        };
        if tick_secs == 0 {
            return Err(ConfigError::InvalidEnv {
                var: "INGEST_TICK_SECS",
                value: "0".to_string(),
            });
        }

        let workers = match overrides.workers {
            Some(n) => n,
            None => parse_number(get("INGEST_WORKERS"), "INGEST_WORKERS", *DEFAULT_WORKERS)?,
        };
        if workers == 0 {
            return Err(ConfigError::InvalidEnv {
                var: "INGEST_WORKERS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            work_dir,
            bucket,
            store,
            converter,
            tick: Duration::from_secs(tick_secs),
            workers,
        })
    }

    /// Process variables available to every parameter template.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(
            "work_dir".to_string(),
            self.work_dir.to_string_lossy().into_owned(),
        );
        vars.insert("bucket".to_string(), self.bucket.clone());
        vars
    }
}

fn parse_number<T: FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(text) => text
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value: text }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config =
            ProcessConfig::from_lookup(lookup(&[("INGEST_BUCKET", "lake")]), &ConfigOverrides::default())
                .unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/opt/ingest"));
        assert_eq!(config.store, StoreBackend::Local(PathBuf::from("/opt/ingest/store")));
        assert_eq!(config.tick, Duration::from_secs(30));
        assert!(config.workers >= 1);
        assert!(config.converter.is_none());
    }

    #[test]
    fn test_bucket_required() {
        let err = ProcessConfig::from_lookup(lookup(&[]), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("INGEST_BUCKET")));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = ConfigOverrides {
            work_dir: Some(PathBuf::from("/data")),
            bucket: Some("other".to_string()),
            workers: Some(3),
            tick_secs: Some(5),
        };
        let config = ProcessConfig::from_lookup(
            lookup(&[("INGEST_BUCKET", "lake"), ("INGEST_HOME", "/srv"), ("INGEST_WORKERS", "8")]),
            &overrides,
        )
        .unwrap();
        assert_eq!(config.bucket, "other");
        assert_eq!(config.work_dir, PathBuf::from("/data"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.tick, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values() {
        let err = ProcessConfig::from_lookup(
            lookup(&[("INGEST_BUCKET", "lake"), ("INGEST_WORKERS", "many")]),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "INGEST_WORKERS", .. }));

        let err = ProcessConfig::from_lookup(
            lookup(&[("INGEST_BUCKET", "lake"), ("INGEST_STORE", "s3")]),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "INGEST_STORE", .. }));

        let err = ProcessConfig::from_lookup(
            lookup(&[("INGEST_BUCKET", "lake"), ("INGEST_TICK_SECS", "0")]),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "INGEST_TICK_SECS", .. }));
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("gcs".parse::<StoreBackend>().unwrap(), StoreBackend::Gcs);
        assert_eq!(
            "local:/tmp/objects".parse::<StoreBackend>().unwrap(),
            StoreBackend::Local(PathBuf::from("/tmp/objects"))
        );
        assert!("local:".parse::<StoreBackend>().is_err());
        assert_eq!(StoreBackend::Gcs.to_string(), "gcs");
    }

    #[test]
    fn test_variables() {
        let config = ProcessConfig::from_lookup(
            lookup(&[("INGEST_BUCKET", "lake"), ("INGEST_HOME", "/srv/ingest")]),
            &ConfigOverrides::default(),
        )
        .unwrap();
        let vars = config.variables();
        assert_eq!(vars["work_dir"], "/srv/ingest");
        assert_eq!(vars["bucket"], "lake");
    }
}
