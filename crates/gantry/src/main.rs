//! The Gantry control plane.
//!
//! `gantry serve` runs the control plane until it receives SIGINT or SIGTERM.
//! `gantry check` translates whatever is currently in storage once, prints a
//! report for every object, and exits non-zero if anything was rejected.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gantry_core::{
    discovery::{ConsulCatalog, ConsulClient, UpstreamDiscovery},
    AdminServer, EventLoop, LatestInput, Registry, Reporter, Settings, SnapshotCache,
    SnapshotEmitter, Storage, Translator, XdsServer, XdsSnapshot,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod check;

/// An xDS control plane for Envoy-based API gateways.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a YAML settings file. Every setting has a default.
    #[arg(long, short, env = "GANTRY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// The default log filter. Overridden by RUST_LOG.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log as JSON instead of plain text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the control plane. This is the default.
    Serve,

    /// Translate the current configuration once and report on every object.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let settings = match load_settings(args.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(err = %e, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };

    let res = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Check => check::run(&settings).await,
    };

    match res {
        Ok(code) => code,
        Err(e) => {
            error!(err = %e, "gantry failed to start");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_settings(path: Option<&PathBuf>) -> gantry_core::Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path),
        None => {
            let settings = Settings::default();
            settings.validate()?;
            Ok(settings)
        }
    }
}

type TaskResult = (&'static str, gantry_core::Result<()>);

/// Start every component and run until a shutdown signal arrives or a
/// component exits on its own.
///
/// Errors returned from here happened during startup. A component that dies
/// while running is logged and turned into a non-zero exit code.
async fn serve(settings: Settings) -> gantry_core::Result<ExitCode> {
    let cancel = CancellationToken::new();

    let storage = Storage::from_settings(&settings.storage).await?;
    let registry = Registry::with_defaults(&settings)?;
    info!(plugins = ?registry.names(), "initialized plugins");

    let cache = SnapshotCache::new();
    let latest = LatestInput::default();
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();

    if let Some(consul) = &settings.consul {
        let catalog: Arc<dyn ConsulCatalog> = Arc::new(ConsulClient::new(consul)?);
        let discovery = UpstreamDiscovery::new(
            catalog,
            consul.clone(),
            &settings.write_namespace,
            storage.upstreams.clone(),
        );
        let cancel = cancel.child_token();
        tasks.spawn(async move {
            discovery.run(cancel).await;
            ("consul upstream discovery", Ok(()))
        });
    }

    let channels = SnapshotEmitter::new(storage.clone(), registry.clone(), &settings)
        .start(cancel.child_token())
        .await?;

    let event_loop = EventLoop::new(
        Translator::new(registry, settings.clone()),
        Reporter::new(storage.reports.clone()),
        cache.clone(),
        latest.clone(),
        &settings,
    );
    let loop_cancel = cancel.clone();
    tasks.spawn(async move {
        event_loop.run(channels, loop_cancel).await;
        ("event loop", Ok(()))
    });

    let bad_node = XdsSnapshot::bad_node(&settings.bind_address, settings.bind_port)?;
    let xds = XdsServer::new(cache.clone(), bad_node);
    let (xds_addr, xds_cancel) = (settings.xds_address, cancel.clone());
    tasks.spawn(async move { ("xds server", xds.serve(xds_addr, xds_cancel).await) });

    if let Some(admin_addr) = settings.admin_address {
        let admin = AdminServer::new(latest, cache);
        let admin_cancel = cancel.clone();
        tasks.spawn(async move { ("admin server", admin.serve(admin_addr, admin_cancel).await) });
    }

    info!(xds = %settings.xds_address, "gantry started");

    let mut clean = true;
    tokio::select! {
        _ = shutdown_signal() => (),
        Some(exited) = tasks.join_next() => {
            // nothing is supposed to stop before shutdown
            log_exit(exited, true);
            clean = false;
        }
    }

    info!("shutting down");
    cancel.cancel();
    while let Some(exited) = tasks.join_next().await {
        clean &= log_exit(exited, false);
    }

    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Log a finished task. Returns `true` if it finished cleanly.
fn log_exit(exited: Result<TaskResult, tokio::task::JoinError>, early: bool) -> bool {
    match exited {
        Ok((task, Ok(()))) if early => {
            error!(task, "stopped unexpectedly");
            false
        }
        Ok((task, Ok(()))) => {
            info!(task, "stopped");
            true
        }
        Ok((task, Err(e))) => {
            error!(task, err = %e, "failed");
            false
        }
        Err(e) => {
            error!(err = %e, "task panicked");
            false
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                }
                return;
            }
            Err(e) => warn!(err = %e, "failed to install SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received SIGINT"),
        Err(e) => {
            // without a signal handler the only way out is a task failing
            error!(err = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::parse_from(["gantry", "check", "--config", "/etc/gantry.yaml"]);
        assert_eq!(args.command, Some(Command::Check));
        assert_eq!(args.config, Some(PathBuf::from("/etc/gantry.yaml")));
        assert_eq!(args.log_level, "info");

        let args = Args::parse_from(["gantry", "--log-json"]);
        assert_eq!(args.command, None);
        assert!(args.log_json);
    }

    #[test]
    fn test_load_settings() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings, Settings::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "bind_port: 80\nsecure_bind_port: 80\n").unwrap();
        assert!(load_settings(Some(&path)).is_err());

        std::fs::write(&path, "bind_port: 80\nsecure_bind_port: 443\n").unwrap();
        assert_eq!(load_settings(Some(&path)).unwrap().bind_port, 80);
    }
}
