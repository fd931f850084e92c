//! Command line and environment configuration.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use rekord_persist::EngineConfig;
use rekord_reconciler::{BackoffConfig, ControllerConfig};

#[derive(Parser, Debug)]
#[command(name = "rekord-watcher", version, about = "Mirror build and pipeline runs into a record store")]
pub struct Cli {
    /// Kinds to watch (repeatable; default: all)
    #[arg(long = "kind", env = "REKORD_KINDS", value_enum, value_delimiter = ',')]
    pub kinds: Vec<Kind>,

    /// Restrict watches to one namespace (default: all namespaces)
    #[arg(long, env = "REKORD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Workers per kind
    #[arg(long, env = "REKORD_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Number of cooperating replicas
    #[arg(long, env = "REKORD_REPLICAS", default_value_t = 1)]
    pub replicas: usize,

    /// This replica's ordinal in `0..replicas`
    #[arg(long, env = "REKORD_ORDINAL", default_value_t = 0)]
    pub ordinal: usize,

    /// Leader buckets identities are hashed into
    #[arg(long, env = "REKORD_BUCKETS", default_value_t = 1)]
    pub buckets: usize,

    /// SQLite record store (default: $HOME/.rekord/rekord.db)
    #[arg(long = "db-path", env = "REKORD_DB_PATH")]
    pub db_path: Option<String>,

    /// Delta channel and coalescer capacity per kind
    #[arg(long = "queue-cap", env = "REKORD_QUEUE_CAP", default_value_t = 2048)]
    pub queue_cap: usize,

    #[arg(long = "backoff-base-ms", env = "REKORD_BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    #[arg(long = "backoff-max-secs", env = "REKORD_BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Hold a finalizer on watched resources until their record is released
    #[arg(long, env = "REKORD_FINALIZER")]
    pub finalizer: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Kind {
    #[value(name = "buildrun")]
    BuildRun,
    #[value(name = "pipelinerun")]
    PipelineRun,
    #[value(name = "taskrun")]
    TaskRun,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ordinal {ordinal} out of range for {replicas} replica(s)")]
    OrdinalOutOfRange { ordinal: usize, replicas: usize },
    #[error("at least one leader bucket is required")]
    NoBuckets,
    #[error("more buckets than supported ({0} > {max})", max = u16::MAX)]
    TooManyBuckets(usize),
    #[error("fewer buckets ({buckets}) than replicas ({replicas}); some replicas would own nothing")]
    FewerBucketsThanReplicas { buckets: usize, replicas: usize },
    #[error("backoff base {base:?} exceeds cap {max:?}")]
    BackoffInverted { base: Duration, max: Duration },
}

/// Validated process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kinds: Vec<Kind>,
    pub namespace: Option<String>,
    pub ordinal: usize,
    pub replicas: usize,
    pub buckets: usize,
    pub db_path: String,
    pub queue_cap: usize,
    pub controller: ControllerConfig,
    pub engine: EngineConfig,
}

impl Cli {
    pub fn settings(self) -> Result<Settings, ConfigError> {
        if self.ordinal >= self.replicas {
            return Err(ConfigError::OrdinalOutOfRange { ordinal: self.ordinal, replicas: self.replicas });
        }
        if self.buckets == 0 {
            return Err(ConfigError::NoBuckets);
        }
        if self.buckets > u16::MAX as usize {
            return Err(ConfigError::TooManyBuckets(self.buckets));
        }
        if self.buckets < self.replicas {
            return Err(ConfigError::FewerBucketsThanReplicas { buckets: self.buckets, replicas: self.replicas });
        }
        let backoff = BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_secs(self.backoff_max_secs),
        };
        if backoff.base > backoff.max {
            return Err(ConfigError::BackoffInverted { base: backoff.base, max: backoff.max });
        }

        let mut kinds = self.kinds;
        if kinds.is_empty() {
            kinds = vec![Kind::BuildRun, Kind::PipelineRun, Kind::TaskRun];
        }
        kinds.sort();
        kinds.dedup();

        Ok(Settings {
            kinds,
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
            ordinal: self.ordinal,
            replicas: self.replicas,
            buckets: self.buckets,
            db_path: self.db_path.unwrap_or_else(rekord_persist::default_db_path),
            queue_cap: self.queue_cap.max(1),
            controller: ControllerConfig { workers: self.workers.max(1), backoff },
            engine: EngineConfig { finalizer: self.finalizer },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rekord-watcher").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_watch_everything() {
        let s = parse(&["--db-path", "/tmp/r.db"]).settings().unwrap();
        assert_eq!(s.kinds, vec![Kind::BuildRun, Kind::PipelineRun, Kind::TaskRun]);
        assert_eq!(s.namespace, None);
        assert_eq!((s.ordinal, s.replicas, s.buckets), (0, 1, 1));
        assert_eq!(s.queue_cap, 2048);
        assert_eq!(s.controller, ControllerConfig::default());
        assert!(!s.engine.finalizer);
    }

    #[test]
    fn kinds_accept_lists_and_repeats() {
        let s = parse(&["--kind", "taskrun,buildrun", "--kind", "taskrun"]).settings().unwrap();
        assert_eq!(s.kinds, vec![Kind::BuildRun, Kind::TaskRun]);
        assert!(Cli::try_parse_from(["rekord-watcher", "--kind", "deployment"]).is_err());
    }

    #[test]
    fn partitioning_is_validated() {
        let err = parse(&["--replicas", "3", "--ordinal", "3"]).settings().unwrap_err();
        assert_eq!(err, ConfigError::OrdinalOutOfRange { ordinal: 3, replicas: 3 });
        let err = parse(&["--replicas", "0"]).settings().unwrap_err();
        assert_eq!(err, ConfigError::OrdinalOutOfRange { ordinal: 0, replicas: 0 });
        assert_eq!(parse(&["--buckets", "0"]).settings().unwrap_err(), ConfigError::NoBuckets);
        assert!(matches!(parse(&["--buckets", "70000"]).settings(), Err(ConfigError::TooManyBuckets(70000))));

        let s = parse(&["--replicas", "3", "--ordinal", "2", "--buckets", "64"]).settings().unwrap();
        assert_eq!((s.ordinal, s.replicas, s.buckets), (2, 3, 64));
    }

    #[test]
    fn every_replica_owns_a_bucket() {
        // Default of one bucket only suits a single replica.
        let err = parse(&["--replicas", "3", "--ordinal", "0"]).settings().unwrap_err();
        assert_eq!(err, ConfigError::FewerBucketsThanReplicas { buckets: 1, replicas: 3 });
        assert_eq!(
            err.to_string(),
            "fewer buckets (1) than replicas (3); some replicas would own nothing"
        );
        assert!(parse(&["--replicas", "4", "--ordinal", "1", "--buckets", "3"]).settings().is_err());

        let s = parse(&["--replicas", "3", "--ordinal", "1", "--buckets", "3"]).settings().unwrap();
        assert_eq!((s.replicas, s.buckets), (3, 3));
    }

    #[test]
    fn backoff_and_engine_flags() {
        let s = parse(&["--backoff-base-ms", "50", "--backoff-max-secs", "60", "--workers", "0", "--finalizer"])
            .settings()
            .unwrap();
        assert_eq!(s.controller.backoff.base, Duration::from_millis(50));
        assert_eq!(s.controller.backoff.max, Duration::from_secs(60));
        assert_eq!(s.controller.workers, 1);
        assert!(s.engine.finalizer);

        let err = parse(&["--backoff-base-ms", "5000", "--backoff-max-secs", "1"]).settings().unwrap_err();
        assert!(matches!(err, ConfigError::BackoffInverted { .. }));
    }
}
