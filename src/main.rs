//! dnsgate: TCP/DoT front-end for an authoritative-DNS load balancer
//!
//! # Usage
//!
//! ```bash
//! # Run with a configuration file
//! dnsgate -c /etc/dnsgate/config.json
//!
//! # Validate a configuration and exit
//! dnsgate -c config.json --check
//!
//! # Override the log level
//! DNSGATE_LOG_LEVEL=debug dnsgate -c config.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use dnsgate::backend::Backend;
use dnsgate::config::{load_config_with_env, GateConfig, LogConfig};
use dnsgate::frontend::{Acceptor, ClientTracker, EngineContext, Frontend, WorkerPool};
use dnsgate::pipeline::ForwardingPipeline;
use dnsgate::rings::ResponseRing;

/// Entries kept in the response observation ring
const RESPONSE_RING_CAPACITY: usize = 10_000;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check the configuration and exit
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/dnsgate/config.json");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("dnsgate v{}", dnsgate::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"dnsgate v{}

TCP/DoT front-end for an authoritative-DNS load balancer.

USAGE:
    dnsgate [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Configuration file path [default: /etc/dnsgate/config.json]
    --check               Check the configuration and exit
    -h, --help            Print help information
    -v, --version         Print version information

ENVIRONMENT:
    DNSGATE_LOG_LEVEL                Override the log level (trace..error)
    DNSGATE_WORKERS                  Override the worker count
    DNSGATE_MAX_QUEUED_CONNECTIONS   Override the accept-queue depth
"#,
        dnsgate::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &LogConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("rustls=warn".parse().expect("valid directive"))
        .add_directive("tokio=warn".parse().expect("valid directive"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Assemble the shared engine context from the configuration
fn build_context(config: &GateConfig) -> Arc<EngineContext> {
    let backends: Vec<Arc<Backend>> = config
        .backends
        .iter()
        .map(|backend| Arc::new(Backend::from_config(backend)))
        .collect();

    for backend in &backends {
        info!(
            backend = %backend.name,
            addr = %backend.addr,
            proxy_protocol = backend.use_proxy_protocol,
            "backend configured"
        );
    }

    let pipeline = Arc::new(ForwardingPipeline::new(backends, config.backend_selection));

    Arc::new(EngineContext {
        pipeline,
        rings: Arc::new(ResponseRing::new(RESPONSE_RING_CAPACITY)),
        limits: config.limits.clone(),
        tracker: Arc::new(ClientTracker::new(
            config.limits.max_queued_connections,
            config.limits.max_connections_per_client,
        )),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "failed to load configuration from {:?}: {e}",
            args.config_path
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config.log);
    info!("dnsgate v{}", dnsgate::VERSION);
    info!("configuration loaded from {:?}", args.config_path);

    let ctx = build_context(&config);

    let worker_count = config.workers.unwrap_or_else(num_cpus::get);
    let workers = Arc::new(WorkerPool::spawn(worker_count, &ctx));
    info!(workers = workers.worker_count(), "worker pool started");

    let mut acceptor_handles = Vec::new();
    for listener_config in &config.listeners {
        let frontend = Arc::new(Frontend::from_config(listener_config)?);
        let acceptor = Acceptor::bind(frontend, Arc::clone(&ctx), Arc::clone(&workers)).await?;
        acceptor_handles.push(tokio::spawn(async move {
            if let Err(e) = acceptor.run().await {
                error!(error = %e, "acceptor stopped");
            }
        }));
    }

    info!(listeners = acceptor_handles.len(), "dnsgate ready");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        () = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }

    for handle in acceptor_handles {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
