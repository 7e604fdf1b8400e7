//! Trilateration server - CLI entry point
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:3200)
//! trilat-server
//!
//! # Warm-start the solver and keep measurements for two minutes
//! trilat-server --initial-guess last-fix --max-measurement-age-secs 120
//!
//! # Only track one device out of multi-target reports
//! trilat-server --target-id PHONE --log-level debug
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trilat_core::{Calibration, InitialGuess, SolverConfig};
use trilat_server::{serve_with_shutdown, Coordinator, ServerConfig, ServerError, DEFAULT_PORT};

/// Coordination service for RSSI anchor trilateration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// HTTP and WebSocket port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Time a new anchor has to register before it gets an address-derived identity
    #[arg(long, default_value = "500")]
    identity_grace_ms: u64,

    /// Interval of the status log
    #[arg(long, default_value = "30")]
    status_interval_secs: u64,

    /// Default RSSI at one meter (dBm)
    #[arg(long, default_value = "-60.0", allow_hyphen_values = true)]
    rssi_at_1m: f64,

    /// Default path-loss exponent
    #[arg(long, default_value = "2.0")]
    path_loss: f64,

    /// Ignore measurements older than this (0 keeps them forever)
    #[arg(long, default_value = "60")]
    max_measurement_age_secs: u64,

    /// Target id to pick out of multi-target RSSI reports
    #[arg(long)]
    target_id: Option<String>,

    /// Solver iteration cap
    #[arg(long, default_value = "100")]
    max_iterations: usize,

    /// Solver step size
    #[arg(long, default_value = "0.1")]
    step_size: f64,

    /// Gradient magnitude at which the solver stops
    #[arg(long, default_value = "0.001")]
    convergence_threshold: f64,

    /// Solver starting point (origin, last-fix, centroid)
    #[arg(long, default_value = "origin")]
    initial_guess: InitialGuess,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, String> {
        let calibration = Calibration::new(self.rssi_at_1m, self.path_loss);
        if !calibration.is_valid() {
            return Err(format!(
                "invalid default calibration: rssi_at_1m={}, path_loss={}",
                self.rssi_at_1m, self.path_loss
            ));
        }

        let solver = SolverConfig {
            max_iterations: self.max_iterations,
            step_size: self.step_size,
            convergence_threshold: self.convergence_threshold,
            ..SolverConfig::default()
        };
        solver
            .validate()
            .map_err(|e| format!("invalid solver settings: {}", e))?;

        let max_age = match self.max_measurement_age_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let mut config = ServerConfig::new()
            .with_listen(self.bind, self.port)
            .with_identity_grace(Duration::from_millis(self.identity_grace_ms))
            .with_status_interval(Duration::from_secs(self.status_interval_secs.max(1)))
            .with_default_calibration(calibration)
            .with_max_measurement_age(max_age)
            .with_solver(solver)
            .with_initial_guess(self.initial_guess);

        if let Some(target) = self.target_id {
            config = config.with_target_filter(target);
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = args.into_config()?;
    let addr = config.socket_addr();

    info!(
        "Solver: max_iterations={}, step_size={}, threshold={}, initial_guess={:?}",
        config.solver.max_iterations,
        config.solver.step_size,
        config.solver.convergence_threshold,
        config.initial_guess
    );

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!("Server starting on {}", addr);

    let coordinator = Arc::new(Coordinator::new(config));
    let status_task = tokio::spawn(coordinator.clone().run_status_task());

    let result = serve_with_shutdown(listener, coordinator, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down...");
    })
    .await;

    status_task.abort();
    result.map_err(ServerError::Io)?;
    info!("Server stopped");
    Ok(())
}
