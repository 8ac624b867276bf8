//! Interceptor Agent
//!
//! Runs the mock-serving MITM proxy with its admin and live observation API,
//! or, with `--feed stdin`, only the observation side over the trace output
//! of a proxy running elsewhere.

use clap::{Parser, ValueEnum};
use interceptor_core::{
    InterceptService, InterceptorConfig, MonitorExit, ProxyMode, SessionRecorder, TrafficMonitor,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod admin;
pub mod ca;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod proxy;

pub use error::{AgentError, Result};

/// Where the live observation path reads trace lines from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeedSource {
    /// Trace written by this process's own proxy
    Internal,
    /// Trace lines piped in on stdin
    Stdin,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML file with startup configuration; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Port to listen on for HTTP/HTTPS traffic
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Port to expose the admin and event API
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Interception rule file (YAML)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Host blacklist file
    #[arg(long)]
    pub blacklist: Option<PathBuf>,

    /// Session transcript file
    #[arg(long)]
    pub transcript: Option<PathBuf>,

    /// Do not write a session transcript
    #[arg(long, conflicts_with = "transcript")]
    pub no_transcript: bool,

    /// Trace verbosity: minimal or verbose
    #[arg(long)]
    pub mode: Option<ProxyMode>,

    /// Source of the live traffic feed
    #[arg(long, value_enum, default_value_t = FeedSource::Internal)]
    pub feed: FeedSource,

    /// Also print the trace to stdout
    #[arg(long)]
    pub echo: bool,

    /// Path to the CA certificate (PEM)
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Path to the CA private key (PEM)
    #[arg(long)]
    pub ca_key: Option<PathBuf>,

    /// Log level for the interceptor crates (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Startup configuration: the config file (or defaults) with flags
    /// applied on top
    pub fn to_config(&self) -> Result<InterceptorConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&text).map_err(|e| {
                    AgentError::Configuration(format!("Invalid config {}: {}", path.display(), e))
                })?
            }
            None => InterceptorConfig::default(),
        };

        if let Some(addr) = &self.listen_addr {
            config.listen_address = addr.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(port) = self.admin_port {
            config.admin_port = port;
        }
        if let Some(path) = &self.rules {
            config.rules_path = path.clone();
        }
        if let Some(path) = &self.blacklist {
            config.blacklist_path = path.clone();
        }
        if let Some(path) = &self.transcript {
            config.transcript_path = Some(path.clone());
        }
        if self.no_transcript {
            config.transcript_path = None;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(path) = &self.ca_cert {
            config.certificate_config.ca_cert_path = path.clone();
        }
        if let Some(path) = &self.ca_key {
            config.certificate_config.ca_key_path = path.clone();
        }
        Ok(config)
    }
}

/// Run until `shutdown` is cancelled, or until the proxy fails
pub async fn run_agent(args: Args, shutdown: CancellationToken) -> Result<()> {
    let config = args.to_config()?;

    info!("Starting Interceptor Agent...");
    info!("  Listen: {}", config.listen_addr());
    info!("  Admin:  {}:{}", config.listen_address, config.admin_port);
    info!("  Rules:  {}", config.rules_path.display());
    info!("  Feed:   {:?}", args.feed);

    let admin_addr: SocketAddr = format!("{}:{}", config.listen_address, config.admin_port)
        .parse()
        .map_err(|e| AgentError::Configuration(format!("Invalid admin address: {}", e)))?;

    match args.feed {
        FeedSource::Internal => run_with_proxy(config, admin_addr, args.echo, shutdown).await,
        FeedSource::Stdin => run_stdin_monitor(config, admin_addr, args.echo, shutdown).await,
    }
}

async fn run_with_proxy(
    config: InterceptorConfig,
    admin_addr: SocketAddr,
    echo: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let proxy_addr: SocketAddr = config
        .listen_addr()
        .parse()
        .map_err(|e| AgentError::Configuration(format!("Invalid listen address: {}", e)))?;
    let ca = ca::CertificateAuthority::load(&config.certificate_config)?;

    let (trace_tx, trace_rx) = mpsc::channel(config.trace_capacity.max(1));
    let mut recorder = SessionRecorder::new(config.mode).with_trace(trace_tx);
    if let Some(path) = &config.transcript_path {
        recorder = recorder.with_transcript(path)?;
    }
    let service = Arc::new(InterceptService::new(&config, recorder));

    let feed = ReceiverStream::new(trace_rx).map(move |block| {
        if echo {
            println!("{}", block);
        }
        Ok::<_, std::io::Error>(block)
    });
    let monitor = TrafficMonitor::new(service.bus().clone(), shutdown.child_token()).spawn(feed);
    let admin = spawn_admin(admin_addr, service.clone(), &shutdown);

    service.start_session();
    let result = proxy::ProxyServer::new(proxy_addr, ca, service.clone())
        .with_cache_size(config.certificate_config.cache_size)
        .run(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    finish(monitor, admin).await;
    result
}

async fn run_stdin_monitor(
    config: InterceptorConfig,
    admin_addr: SocketAddr,
    echo: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let service = Arc::new(InterceptService::new(
        &config,
        SessionRecorder::new(config.mode),
    ));

    let lines = LinesStream::new(tokio::io::BufReader::new(tokio::io::stdin()).lines());
    let feed = lines.map(move |line| {
        if echo {
            if let Ok(line) = &line {
                println!("{}", line);
            }
        }
        line
    });
    service.bus().begin_session(config.listen_port, config.mode);
    let monitor = TrafficMonitor::new(service.bus().clone(), shutdown.child_token()).spawn(feed);
    let admin = spawn_admin(admin_addr, service, &shutdown);

    // The admin API keeps serving the final state after the feed ends
    shutdown.cancelled().await;
    finish(monitor, admin).await;
    Ok(())
}

fn spawn_admin(
    addr: SocketAddr,
    service: Arc<InterceptService>,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin::start_admin_server(addr, service, stop.clone().cancelled_owned()).await {
            warn!("Admin server failed: {}", e);
            stop.cancel();
        }
    })
}

async fn finish(monitor: JoinHandle<MonitorExit>, admin: JoinHandle<()>) {
    match monitor.await {
        Ok(exit) => info!("Traffic monitor finished: {:?}", exit),
        Err(e) => warn!("Traffic monitor task failed: {}", e),
    }
    if let Err(e) = admin.await {
        warn!("Admin task failed: {}", e);
    }
}
