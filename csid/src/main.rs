//! `csid`: GlusterFS CSI plugin process.
//!
//! Runs as the provisioner (Controller) or as the per-node plugin, depending
//! on `CSI_ROLE`.  SIGHUP reapplies hosting volume mounts; SIGINT/SIGTERM
//! drain in-flight RPCs and exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::RangedU64ValueParser;
use clap::{Parser, ValueEnum};
use libcsi::config::{
    DEFAULT_DRIVER_NAME, DEFAULT_ENDPOINT, DEFAULT_LOG_DIR, DEFAULT_MAX_WORKERS, DEFAULT_RUN_DIR,
    DEFAULT_VOLFILE_DIR, DEFAULT_VOLINFO_DIR, ENV_ENDPOINT, ENV_HOSTVOL_MOUNTDIR, ENV_ROLE,
    HOSTVOL_MOUNTDIR,
};
use libcsi::{
    CsiServer, Endpoint, GlusterMounter, HostVolBackend, InfoDirectory, MountReconciler,
    PluginConfig, Role,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "csid", version, about = "GlusterFS CSI plugin for RK8s")]
struct Args {
    /// Deployment role; only "provisioner" mounts hosting volumes at startup.
    #[arg(long, env = ENV_ROLE)]
    role: Option<String>,

    /// gRPC listen address: unix://<path>, tcp://<host:port> or <host:port>.
    #[arg(long, env = ENV_ENDPOINT, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Root directory of hosting volume mounts.
    #[arg(long, env = ENV_HOSTVOL_MOUNTDIR, default_value = HOSTVOL_MOUNTDIR)]
    mount_root: PathBuf,

    /// Directory of `<name>.info` hosting volume descriptors.
    #[arg(long, env = "VOLINFO_DIR", default_value = DEFAULT_VOLINFO_DIR)]
    volinfo_dir: PathBuf,

    /// Directory of `<name>.client.vol` files.
    #[arg(long, env = "VOLFILE_DIR", default_value = DEFAULT_VOLFILE_DIR)]
    volfile_dir: PathBuf,

    #[arg(long, env = "CSI_RUN_DIR", default_value = DEFAULT_RUN_DIR)]
    run_dir: PathBuf,

    #[arg(long, env = "CSI_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Node identifier; defaults to the hostname.
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Per-volume mount/reload timeout in seconds.
    #[arg(
        long,
        env = "CSI_MOUNT_TIMEOUT_SECS",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    mount_timeout_secs: u64,

    /// Concurrent RPCs across all connections.
    #[arg(
        long,
        env = "CSI_MAX_WORKERS",
        default_value_t = DEFAULT_MAX_WORKERS,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
    )]
    max_workers: usize,

    /// Path of the `glusterfs` client binary.
    #[arg(long, env = "GLUSTERFS_BIN", default_value = "glusterfs")]
    glusterfs_bin: PathBuf,

    #[arg(long, env = "CSI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn into_config(self) -> Result<PluginConfig> {
        let endpoint: Endpoint = self
            .endpoint
            .parse()
            .with_context(|| format!("invalid {ENV_ENDPOINT}"))?;
        let node_id = match self.node_id {
            Some(id) => id,
            None => nix::unistd::gethostname()
                .context("failed to read hostname")?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(PluginConfig {
            role: Role::from_env_value(self.role.as_deref()),
            endpoint,
            mount_root: self.mount_root,
            volinfo_dir: self.volinfo_dir,
            volfile_dir: self.volfile_dir,
            run_dir: self.run_dir,
            log_dir: self.log_dir,
            node_id,
            driver_name: self.driver_name,
            mount_timeout: Duration::from_secs(self.mount_timeout_secs),
            max_workers: self.max_workers,
            ..Default::default()
        })
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Completes on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
            info!("SIGINT received");
        }
        _ = sigterm => info!("SIGTERM received"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let glusterfs_bin = args.glusterfs_bin.clone();
    let config = args.into_config()?;
    info!(
        role = %config.role,
        endpoint = %config.endpoint,
        node_id = %config.node_id,
        "starting csid {}",
        env!("CARGO_PKG_VERSION"),
    );

    let directory = Arc::new(InfoDirectory::new(&config.volinfo_dir));
    let mounter = Arc::new(
        GlusterMounter::new(
            &config.mount_root,
            &config.volfile_dir,
            &config.run_dir,
            &config.log_dir,
        )
        .with_program(glusterfs_bin),
    );
    let reconciler = Arc::new(
        MountReconciler::new(
            directory.clone(),
            mounter.clone(),
            config.role,
            &config.mount_root,
        )
        .with_timeout(config.mount_timeout)
        .with_parallelism(config.pass_parallelism),
    );
    let backend = Arc::new(
        HostVolBackend::new(&config.mount_root, directory, mounter, config.node_id.clone())
            .with_driver_name(config.driver_name.clone()),
    );

    CsiServer::new(config, backend, reconciler)
        .run(shutdown_signal())
        .await
        .context("CSI server failed")?;

    info!("csid exited cleanly");
    Ok(())
}
