//! Daemon lifecycle
//!
//! Owns startup and shutdown: acquire the HA lease, bootstrap the
//! metadata schema, resolve the initial cursor, make sure a schema
//! snapshot exists, then run the replicator with the heartbeat emitter
//! and the compactor alongside. Shutdown is an explicit signal observed
//! at the pipeline's suspension points; workers drain in reverse
//! dependency order.

pub mod cli;
pub mod replay;

pub use cli::{Cli, ProducerKind};

use millrace::error::{MillraceError, Result};
use millrace::lease::{LeaderElection, LocalElection, SharedElection, StandaloneElection};
use millrace::producer::{FileProducer, SharedProducer, StdoutProducer};
use millrace::replication::{
    BinlogClient, HeartbeatEmitter, MysqlHeartbeatWriter, MysqlLiveSchema, Recovery,
    RecoveryConfig, Replicator, ReplicatorConfig,
};
use millrace::schema::capture;
use millrace::store::{
    ensure_metadata_schema, Compactor, MysqlPositionStore, MysqlSchemaStore, SchemaStore,
    SharedPositionStore, SharedSchemaStore,
};
use millrace::TableFilter;
use mysql_async::{Opts, Pool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the daemon until completion or shutdown. `shutdown` flips to
/// `true` when the process should drain and exit.
pub async fn run(cli: Cli, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    // HA gate: only the leader replicates. The in-process election
    // backs single-host deployments; a clustered primitive plugs in
    // behind the same trait.
    let election: SharedElection = if cli.ha {
        Arc::new(LocalElection::new())
    } else {
        Arc::new(StandaloneElection::new())
    };
    let mut lease = election.acquire(&cli.ha_group(), &cli.client_id).await?;

    let upstream_pool = Pool::new(
        Opts::from_url(&cli.upstream_dsn)
            .map_err(|e| MillraceError::config(format!("invalid upstream DSN: {e}")))?,
    );
    let metadata_pool = match &cli.metadata_dsn {
        Some(dsn) => Pool::new(
            Opts::from_url(dsn)
                .map_err(|e| MillraceError::config(format!("invalid metadata DSN: {e}")))?,
        ),
        None => upstream_pool.clone(),
    };

    // the marker table must exist on the upstream so heartbeat writes
    // come back through the binlog; the metadata server needs the full
    // set of tables
    ensure_metadata_schema(&metadata_pool, &cli.metadata_database).await?;
    if cli.metadata_dsn.is_some() {
        ensure_metadata_schema(&upstream_pool, &cli.metadata_database).await?;
    }

    let mut conn = upstream_pool
        .get_conn()
        .await
        .map_err(MillraceError::from_mysql)?;
    let case = capture::case_sensitivity(&mut conn).await?;

    let client: Arc<dyn BinlogClient> = match &cli.replay {
        Some(path) => {
            info!(path = %path.display(), "replaying a recorded binlog stream");
            Arc::new(replay::load(path).map_err(|e| MillraceError::config(e.to_string()))?)
        }
        None => {
            return Err(MillraceError::config(
                "no binlog source configured; provide --replay or link a wire client",
            ))
        }
    };
    let server_id = client.server_id().await?;

    let position_store: SharedPositionStore = Arc::new(MysqlPositionStore::new(
        metadata_pool.clone(),
        &cli.metadata_database,
        server_id,
        &cli.client_id,
    ));
    let schema_store: SharedSchemaStore = Arc::new(MysqlSchemaStore::new(
        metadata_pool.clone(),
        &cli.metadata_database,
    ));

    let recovery = Recovery::new(
        client.as_ref(),
        position_store.as_ref(),
        schema_store.as_ref(),
        RecoveryConfig {
            client_id: cli.client_id.clone(),
            metadata_database: cli.metadata_database.clone(),
            master_recovery: cli.master_recovery,
            gtid_mode: cli.gtid_mode,
        },
    );
    let initial = recovery.resolve_initial_position().await?;

    // make sure decoding has a snapshot to start from
    let tracked = schema_store.schema_at(server_id, &initial).await?;
    if cli.recapture_schema || tracked.is_none() {
        info!("capturing the upstream schema");
        let schema = capture::capture(&mut conn, case).await?;
        schema_store.save_full(server_id, &initial, &schema).await?;
    }
    drop(conn);

    let producer: SharedProducer = match cli.producer {
        ProducerKind::Stdout => Arc::new(StdoutProducer::new()),
        ProducerKind::File => {
            let path = cli
                .producer_file
                .as_ref()
                .ok_or_else(|| MillraceError::config("--producer file requires --producer-file"))?;
            Arc::new(FileProducer::create(path).await?)
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        producer = ?cli.producer,
        server_id,
        position = %initial,
        "millrace is booting"
    );

    // background workers share one stop flag, observed at their timers
    let (stop_tx, stop_rx) = watch::channel(false);

    let emitter = HeartbeatEmitter::new(
        Arc::new(MysqlHeartbeatWriter::new(
            upstream_pool.clone(),
            &cli.metadata_database,
            server_id,
            &cli.client_id,
        )),
        cli.heartbeat_interval(),
    );
    let heartbeat_task = tokio::spawn(emitter.run(stop_rx.clone()));

    let compactor_task = if cli.compaction_interval_secs > 0 {
        let compactor = Compactor::new(
            schema_store.clone(),
            position_store.clone(),
            server_id,
            Duration::from_secs(cli.compaction_interval_secs),
        );
        Some(tokio::spawn(compactor.run(stop_rx.clone())))
    } else {
        None
    };

    let filter = match cli.filter.as_deref() {
        Some(expr) => TableFilter::parse(expr)
            .map_err(|e| MillraceError::config(format!("invalid filter expression: {e}")))?,
        None => TableFilter::default(),
    };

    let (replicator, handle) = Replicator::new(
        ReplicatorConfig {
            client_id: cli.client_id.clone(),
            metadata_database: cli.metadata_database.clone(),
            gtid_mode: cli.gtid_mode,
            filter,
            ddl_skip_patterns: cli.ddl_skip_patterns.clone(),
        },
        server_id,
        initial,
        client,
        producer,
        schema_store.clone(),
        position_store.clone(),
        Some(Arc::new(MysqlLiveSchema::new(upstream_pool.clone()))),
    );

    // stop the loop on an external shutdown or on losing the lease
    let leadership_lost = Arc::new(AtomicBool::new(false));
    let control = tokio::spawn({
        let leadership_lost = leadership_lost.clone();
        async move {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, draining");
                }
                _ = lease.lost() => {
                    warn!("leadership lost, terminating for restart");
                    leadership_lost.store(true, Ordering::SeqCst);
                }
            }
            handle.stop();
        }
    });

    let result = replicator.run().await;

    // drain in reverse dependency order: the replicator is done, now the
    // timers, then the pools
    let _ = stop_tx.send(true);
    let _ = heartbeat_task.await;
    if let Some(task) = compactor_task {
        let _ = task.await;
    }
    control.abort();
    if let Err(e) = metadata_pool.disconnect().await {
        warn!(error = %e, "metadata pool did not disconnect cleanly");
    }

    match result {
        Ok(()) if leadership_lost.load(Ordering::SeqCst) => Err(MillraceError::LeadershipLost),
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "replication terminated");
            Err(e)
        }
    }
}
