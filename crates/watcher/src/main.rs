//! rekord-watcher: one controller per watched kind, all feeding the same record store.

#![forbid(unsafe_code)]

mod config;

use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource};
use rekord_core::{BucketGate, LeaderGate};
use rekord_kinds::{BuildRun, PipelineRun, TaskRun};
use rekord_kubehub::{kind_api, start_watcher, KubeClientBinder};
use rekord_persist::{RecordEngine, RecordStore, SqliteStore};
use rekord_reconciler::{Controller, Reconcilable, Reconciler, SyncEngine};
use rekord_store::spawn_ingest;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Cli, Kind, Settings};

fn init_tracing() {
    let env = std::env::var("REKORD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKORD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REKORD_METRICS_ADDR; expected host:port");
        }
    }
}

/// Shared pieces every per-kind controller is built from.
struct Shared {
    client: Client,
    gate: Arc<dyn LeaderGate>,
    engine: Arc<dyn SyncEngine>,
    shutdown: CancellationToken,
}

/// Wire watcher → cache → work queue → controller for kind `K`.
fn spawn_kind<K>(shared: &Shared, settings: &Settings) -> Vec<JoinHandle<()>>
where
    K: Reconcilable
        + Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let kind = K::kind(&()).into_owned();
    let (key_tx, mut key_rx) = mpsc::unbounded_channel::<String>();
    let (delta_tx, cache) = spawn_ingest::<K>(settings.queue_cap, key_tx);
    let api = kind_api::<K>(shared.client.clone(), settings.namespace.as_deref());

    let watcher = tokio::spawn({
        let token = shared.shutdown.clone();
        let kind = kind.clone();
        async move {
            tokio::select! {
                _ = token.cancelled() => {}
                res = start_watcher(api, delta_tx) => {
                    if let Err(e) = res {
                        error!(kind = %kind, error = ?e, "watcher failed");
                    }
                }
            }
        }
    });

    let synced = tokio::spawn({
        let cache = cache.clone();
        let kind = kind.clone();
        async move {
            if cache.wait_synced().await {
                info!(kind = %kind, items = cache.current().len(), "cache synced");
            }
        }
    });

    let reconciler = Reconciler::<K>::new(
        shared.gate.clone(),
        Arc::new(cache),
        Arc::new(KubeClientBinder::<K>::new(shared.client.clone())),
        shared.engine.clone(),
    );
    let controller = Controller::new(reconciler, settings.controller);
    let queue = controller.queue();

    // Ends once the ingest loop closes, i.e. after the watcher stopped.
    let pump = tokio::spawn(async move {
        while let Some(key) = key_rx.recv().await {
            queue.add(&key);
        }
    });
    let run = tokio::spawn(controller.run(shared.shutdown.clone()));
    vec![watcher, synced, pump, run]
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let settings = Cli::parse().settings().context("invalid configuration")?;
    info!(
        kinds = ?settings.kinds,
        namespace = ?settings.namespace,
        ordinal = settings.ordinal,
        replicas = settings.replicas,
        buckets = settings.buckets,
        db = %settings.db_path,
        "rekord-watcher starting"
    );

    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&settings.db_path)?);
    let gate = BucketGate::for_ordinal(settings.ordinal, settings.replicas, settings.buckets);
    info!(owned = gate.owned().len(), of = gate.planner().buckets(), "leader buckets assigned");
    let shared = Shared {
        client: rekord_kubehub::get_kube_client().await?,
        gate: Arc::new(gate),
        engine: Arc::new(RecordEngine::new(store, settings.engine)),
        shutdown: CancellationToken::new(),
    };

    let mut handles = Vec::new();
    for kind in &settings.kinds {
        handles.extend(match kind {
            Kind::BuildRun => spawn_kind::<BuildRun>(&shared, &settings),
            Kind::PipelineRun => spawn_kind::<PipelineRun>(&shared, &settings),
            Kind::TaskRun => spawn_kind::<TaskRun>(&shared, &settings),
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shared.shutdown.cancel();
    for h in handles {
        if let Err(e) = h.await {
            warn!(error = %e, "task failed during shutdown");
        }
    }
    info!("rekord-watcher stopped");
    Ok(())
}
