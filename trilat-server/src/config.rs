//! Configuration for the coordination service
//!
//! Combines listener settings, session timing and solver tuning.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use trilat_core::{Calibration, InitialGuess, SolverConfig};

/// Default HTTP/WebSocket port
pub const DEFAULT_PORT: u16 = 3200;

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: IpAddr,

    /// Port for HTTP and the `/ws` endpoint
    pub port: u16,

    /// How long a new connection may take to register before the
    /// service assigns it an identity derived from its address
    pub identity_grace: Duration,

    /// Interval of the registry status log
    pub status_interval: Duration,

    /// Calibration used by anchors without their own pair
    pub default_calibration: Calibration,

    /// Measurements older than this are not used for solving
    pub max_measurement_age: Option<Duration>,

    /// Target id to pick out of multi-target RSSI reports
    pub target_filter: Option<String>,

    /// Solver settings
    pub solver: SolverConfig,

    /// Starting point for each solve
    pub initial_guess: InitialGuess,

    /// Outbound queue depth per connection
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            identity_grace: Duration::from_millis(500),
            status_interval: Duration::from_secs(30),
            default_calibration: Calibration::default(),
            max_measurement_age: Some(Duration::from_secs(60)),
            target_filter: None,
            solver: SolverConfig::default(),
            initial_guess: InitialGuess::Origin,
            outbound_buffer: 64,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket address to bind
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Set listen address and port
    pub fn with_listen(mut self, bind_addr: IpAddr, port: u16) -> Self {
        self.bind_addr = bind_addr;
        self.port = port;
        self
    }

    /// Set identity grace period
    pub fn with_identity_grace(mut self, grace: Duration) -> Self {
        self.identity_grace = grace;
        self
    }

    /// Set status log interval
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Set default calibration
    pub fn with_default_calibration(mut self, calibration: Calibration) -> Self {
        self.default_calibration = calibration;
        self
    }

    /// Set measurement age limit; `None` keeps measurements forever
    pub fn with_max_measurement_age(mut self, age: Option<Duration>) -> Self {
        self.max_measurement_age = age;
        self
    }

    /// Only use readings for this target id
    pub fn with_target_filter(mut self, target: impl Into<String>) -> Self {
        self.target_filter = Some(target.into());
        self
    }

    /// Set solver settings
    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Set initial guess strategy
    pub fn with_initial_guess(mut self, guess: InitialGuess) -> Self {
        self.initial_guess = guess;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3200);
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:3200");
        assert_eq!(config.solver.max_iterations, 100);
        assert_eq!(config.solver.step_size, 0.1);
        assert_eq!(config.solver.convergence_threshold, 0.001);
        assert_eq!(config.initial_guess, InitialGuess::Origin);
        assert_eq!(config.default_calibration, Calibration::new(-60.0, 2.0));
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new()
            .with_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
            .with_identity_grace(Duration::from_millis(50))
            .with_default_calibration(Calibration::new(-45.0, 3.0))
            .with_max_measurement_age(None)
            .with_target_filter("PHONE")
            .with_initial_guess(InitialGuess::Centroid);

        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:4000");
        assert_eq!(config.identity_grace, Duration::from_millis(50));
        assert_eq!(config.default_calibration.path_loss_exponent, 3.0);
        assert_eq!(config.max_measurement_age, None);
        assert_eq!(config.target_filter.as_deref(), Some("PHONE"));
        assert_eq!(config.initial_guess, InitialGuess::Centroid);
    }
}
