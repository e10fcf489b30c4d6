//! server-lifecycle demo binary.
//!
//! Serves a small app through [`Server::start`] with settings taken from an
//! optional TOML file and command-line flags.
//!
//! ```text
//! server-lifecycle --addr :3000 --prefork --print-routes
//! server-lifecycle --config server.toml --cert-file cert.pem --cert-key-file key.pem
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use axum::http::StatusCode;
use clap::Parser;

use server_lifecycle::config::validation::validate_settings;
use server_lifecycle::config::{load_settings, ConfigError, ListenerNetwork, StartSettings};
use server_lifecycle::observability::logging;
use server_lifecycle::{App, Server};

#[derive(Parser, Debug)]
#[command(name = "server-lifecycle")]
#[command(about = "Demo HTTP server with TLS, prefork and graceful shutdown", long_about = None)]
struct Cli {
    /// Address to listen on (`host:port`, empty host for all interfaces)
    #[arg(short, long, default_value = ":3000")]
    addr: String,

    /// TOML settings file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network kind: tcp, tcp4 or tcp6
    #[arg(long)]
    network: Option<ListenerNetwork>,

    /// Share the port across several processes
    #[arg(long)]
    prefork: bool,

    /// Number of prefork children (defaults to one per CPU)
    #[arg(long)]
    prefork_processes: Option<usize>,

    /// Print the route table at startup
    #[arg(long)]
    print_routes: bool,

    #[arg(long)]
    cert_file: Option<PathBuf>,

    #[arg(long)]
    cert_key_file: Option<PathBuf>,

    /// CA bundle for client certificates (enables mutual TLS)
    #[arg(long)]
    cert_client_file: Option<PathBuf>,

    #[arg(long)]
    graceful_timeout_secs: Option<u64>,

    /// Do not print the startup banner
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn settings(&self) -> Result<StartSettings, ConfigError> {
        let mut settings = match &self.config {
            Some(path) => load_settings(path)?,
            None => StartSettings::default(),
        };

        if self.network.is_some() {
            settings.listener_network = self.network;
        }
        if self.cert_file.is_some() {
            settings.cert_file = self.cert_file.clone();
        }
        if self.cert_key_file.is_some() {
            settings.cert_key_file = self.cert_key_file.clone();
        }
        if self.cert_client_file.is_some() {
            settings.cert_client_file = self.cert_client_file.clone();
        }
        if self.graceful_timeout_secs.is_some() {
            settings.graceful_timeout_secs = self.graceful_timeout_secs;
        }
        if self.prefork_processes.is_some() {
            settings.prefork_processes = self.prefork_processes;
        }
        settings.enable_prefork |= self.prefork;
        settings.enable_print_routes |= self.print_routes;
        settings.disable_startup_message |= self.quiet;

        validate_settings(&settings).map_err(ConfigError::Validation)?;
        Ok(settings)
    }
}

async fn index() -> &'static str {
    "Hello from server-lifecycle\n"
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn demo_app() -> App {
    App::new()
        .name("server-lifecycle demo")
        .get("/", index)
        .get("/health", health)
        .on_listen(|| {
            tracing::info!(pid = std::process::id(), "Demo app ready");
            Ok(())
        })
        .on_fork(|pid| tracing::info!(pid, "Forked prefork child"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(logging::DEFAULT_FILTER) {
        eprintln!("failed to initialize logging: {e}");
    }

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %cli.addr,
        prefork = settings.enable_prefork,
        "server-lifecycle starting"
    );

    let server = Server::new(demo_app());
    match server.start(cli.addr.as_str(), Some(settings.into())).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_listener_closed() => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
