//! Coordination service
//!
//! Owns the registry, the solver and the table of live connections. Every
//! accepted distance-bearing report updates the registry and then re-solves
//! from a copy of the eligible anchors, so the registry lock is never held
//! while the solver iterates.
//!
//! ## Report flow
//!
//! ```text
//! anchor frame ─► Session::dispatch ─► Coordinator::record_measurement
//!                                            │ write lock: store rssi/distance
//!                                            ▼
//!                                      eligible_observations (read lock, copy)
//!                                            │
//!                                            ▼
//!                                      PositionSolver::solve (no lock)
//!                                            │
//!                                            ▼
//!                                      update_target (write lock)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use trilat_core::protocol::NodeEntry;
use trilat_core::{
    Calibration, ConnectionId, GradientDescent, InitialGuess, ObservationSet, Outbound, Position,
    PositionSolver, Registration, Registry, RegistryError, RegistrySnapshot, ReplyStyle,
    ServiceMessage, Solution, SolveError,
};

use crate::config::ServerConfig;

/// Service side of one anchor connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<Notify>,
}

impl ConnectionHandle {
    /// Queue a frame without waiting; a full or closed queue drops it
    pub fn send(&self, frame: Outbound) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!("Outbound queue full, dropping {:?}", frame);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection task to shut down
    pub fn close(&self) {
        self.closed.notify_one();
    }
}

/// Everything a connection task needs from the coordinator
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub handle: ConnectionHandle,
    pub outbound_rx: mpsc::Receiver<Outbound>,
    pub closed: Arc<Notify>,
}

/// Shared state behind the HTTP and WebSocket surfaces
pub struct Coordinator {
    config: ServerConfig,
    registry: Registry,
    solver: Box<dyn PositionSolver>,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_connection: AtomicU64,
}

impl Coordinator {
    /// Create a coordinator using the gradient descent solver
    pub fn new(config: ServerConfig) -> Self {
        let solver = GradientDescent::new(config.solver);
        Self::with_solver(config, Box::new(solver))
    }

    /// Create a coordinator with a custom solver
    pub fn with_solver(config: ServerConfig, solver: Box<dyn PositionSolver>) -> Self {
        let registry = Registry::new(config.default_calibration);
        Self {
            config,
            registry,
            solver,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Allocate a connection id and its outbound queue
    pub fn open_connection(&self) -> Connection {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let closed = Arc::new(Notify::new());
        let handle = ConnectionHandle {
            outbound,
            closed: closed.clone(),
        };

        self.connections.lock().insert(id, handle.clone());
        debug!("Connection {} opened", id);

        Connection {
            id,
            handle,
            outbound_rx,
            closed,
        }
    }

    /// Forget a connection and mark its anchor disconnected
    pub fn close_connection(&self, connection: ConnectionId, anchor_id: Option<&str>) {
        self.connections.lock().remove(&connection);

        if let Some(anchor_id) = anchor_id {
            if !self.registry.mark_disconnected(anchor_id, connection) {
                debug!(
                    "Connection {} for {} already superseded",
                    connection, anchor_id
                );
            }
        }
        debug!("Connection {} closed", connection);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Bind a connection to a hardware identity
    ///
    /// Closes any older connection holding the same identity, releases the
    /// connection's previous anchor if the identity changed, answers in the
    /// requested dialect and then broadcasts the node list.
    pub fn register(
        &self,
        connection: ConnectionId,
        hardware_id: &str,
        previous: Option<&str>,
        reply: ReplyStyle,
    ) -> Registration {
        let registration = self.registry.register_or_reuse(hardware_id, connection);

        if let Some(displaced) = registration.displaced {
            info!(
                "Closing connection {} superseded by {} for {}",
                displaced, connection, registration.anchor_id
            );
            if let Some(handle) = self.connections.lock().get(&displaced) {
                handle.close();
            }
        }

        if let Some(previous) = previous {
            if previous != registration.anchor_id {
                info!(
                    "Connection {} re-keyed from {} to {}",
                    connection, previous, registration.anchor_id
                );
                self.registry.mark_disconnected(previous, connection);
                if let Err(e) = self.registry.retire(previous) {
                    debug!("Retire failed: {}", e);
                }
            }
        }

        let id = registration.anchor_id.clone();
        let frame = match reply {
            ReplyStyle::Json => Outbound::Message(ServiceMessage::IdAssignment { id }),
            ReplyStyle::Legacy => Outbound::LegacyId(id),
        };
        self.send_to(connection, frame);

        self.broadcast_node_list();
        registration
    }

    /// Refresh an anchor's liveness
    pub fn touch(&self, anchor_id: &str) {
        if let Err(e) = self.registry.touch(anchor_id) {
            debug!("Touch failed: {}", e);
        }
    }

    /// Store a report and re-solve if it produced a usable distance
    pub fn record_measurement(
        &self,
        anchor_id: &str,
        rssi: Option<f64>,
        distance: Option<f64>,
    ) -> Result<Option<Solution>, RegistryError> {
        let outcome = self.registry.record_measurement(anchor_id, rssi, distance)?;

        match outcome.distance {
            Some(d) => {
                debug!(
                    "Received distance data from {}: RSSI={:?}, Distance={:.2}m",
                    anchor_id, rssi, d
                );
                Ok(self.recompute().ok())
            }
            None => {
                debug!(
                    "Report from {} has no usable distance (rssi={:?}, distance={:?})",
                    anchor_id, rssi, distance
                );
                Ok(None)
            }
        }
    }

    /// Solve from the currently eligible anchors and publish the fix
    ///
    /// The solver is only invoked with at least three ranges, whatever
    /// solver is plugged in. A fix computed from data older than the
    /// published one is discarded.
    pub fn recompute(&self) -> Result<Solution, SolveError> {
        let ObservationSet {
            generation,
            observations,
        } = self
            .registry
            .observation_set(Utc::now(), self.config.max_measurement_age);

        let required = self.config.solver.required_anchors();
        if observations.len() < required {
            let e = SolveError::InsufficientAnchors {
                available: observations.len(),
                required,
            };
            debug!("Skipping trilateration: {}", e);
            self.registry.record_insufficient_data();
            return Err(e);
        }

        let initial_guess = match self.config.initial_guess {
            InitialGuess::Origin => Position::ORIGIN,
            InitialGuess::LastFix => self.registry.target().position,
            InitialGuess::Centroid => Position::centroid(observations.iter().map(|o| &o.anchor))
                .unwrap_or(Position::ORIGIN),
        };

        match self.solver.solve(&observations, initial_guess) {
            Ok(solution) => {
                if !self.registry.update_target(solution, generation) {
                    return Ok(solution);
                }
                info!(
                    "Updated phone position: {} ({} anchors, {} iterations{})",
                    solution.position,
                    solution.anchors_used,
                    solution.iterations,
                    if solution.converged { "" } else { ", unconverged" }
                );
                Ok(solution)
            }
            Err(e) => {
                warn!("Trilateration failed: {}", e);
                self.registry.record_insufficient_data();
                Err(e)
            }
        }
    }

    /// Administrative position write
    pub fn set_anchor_position(&self, anchor_id: &str, position: Position) -> Result<(), RegistryError> {
        self.registry.set_position(anchor_id, position)?;
        info!("Set position for node {}: {}", anchor_id, position);
        Ok(())
    }

    /// Administrative calibration write
    pub fn set_anchor_calibration(
        &self,
        anchor_id: &str,
        calibration: Calibration,
    ) -> Result<(), RegistryError> {
        self.registry.set_calibration(anchor_id, calibration)?;
        info!(
            "Updated calibration for node {}: RSSI@1m={:.2}, PathLoss={:.2}",
            anchor_id, calibration.reference_rssi, calibration.path_loss_exponent
        );
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Queue a frame for one connection
    pub fn send_to(&self, connection: ConnectionId, frame: Outbound) -> bool {
        match self.connections.lock().get(&connection) {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }

    /// Send the known anchors to every connected anchor
    pub fn broadcast_node_list(&self) {
        let snapshot = self.registry.snapshot();
        let nodes: Vec<NodeEntry> = snapshot
            .anchors
            .iter()
            .filter(|a| !a.retired)
            .map(|a| NodeEntry {
                id: a.id.clone(),
                mac: a.hardware_id.clone(),
            })
            .collect();
        let frame = Outbound::Message(ServiceMessage::NodeList { nodes });

        let connections = self.connections.lock();
        for anchor in &snapshot.anchors {
            if let Some(handle) = anchor.connection.and_then(|c| connections.get(&c)) {
                handle.send(frame.clone());
            }
        }
    }

    /// Ask every connection to close
    pub fn shutdown(&self) {
        let connections = self.connections.lock();
        info!("Closing {} connections", connections.len());
        for handle in connections.values() {
            handle.close();
        }
    }

    /// Log the full registry
    pub fn log_status(&self) {
        let snapshot = self.registry.snapshot();
        let now = snapshot.taken_at;

        info!("=== Node Status ===");
        info!(
            "Total nodes: {} ({} connected)",
            snapshot.anchors.len(),
            snapshot.connected_count()
        );

        for anchor in &snapshot.anchors {
            let since = now.signed_duration_since(anchor.last_seen).num_seconds();
            info!(
                "Node {}: {}, Position: {}, Distance: {}, Last seen: {}s ago",
                anchor.id,
                anchor.connection_state(),
                anchor.position,
                anchor
                    .last_distance
                    .map(|d| format!("{:.2}m", d))
                    .unwrap_or_else(|| "-".to_string()),
                since
            );
        }

        if !snapshot.anchors.is_empty() {
            info!("Phone position: {}", snapshot.target.position);
        }
        info!("==================");
    }

    /// Periodic status logging, independent of request traffic
    pub async fn run_status_task(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.status_interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.log_status();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use trilat_core::SolverConfig;

    fn coordinator() -> Coordinator {
        Coordinator::new(ServerConfig::default().with_max_measurement_age(None))
    }

    fn place(c: &Coordinator, hw: &str, position: Position) -> String {
        let conn = c.open_connection();
        let reg = c.register(conn.id, hw, None, ReplyStyle::Json);
        c.set_anchor_position(&reg.anchor_id, position).unwrap();
        reg.anchor_id
    }

    #[test]
    fn test_solve_after_third_anchor() {
        let c = coordinator();
        let target = Position::new(2.0, 1.0, 0.0);
        let anchors = [
            place(&c, "mac-a", Position::new(0.0, 0.0, 0.0)),
            place(&c, "mac-b", Position::new(4.0, 0.0, 0.0)),
            place(&c, "mac-c", Position::new(0.0, 4.0, 0.0)),
        ];
        let positions = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(4.0, 0.0, 0.0),
            Position::new(0.0, 4.0, 0.0),
        ];

        let d0 = positions[0].distance_to(&target);
        let d1 = positions[1].distance_to(&target);
        let d2 = positions[2].distance_to(&target);

        assert_eq!(c.record_measurement(&anchors[0], None, Some(d0)).unwrap(), None);
        assert_eq!(c.record_measurement(&anchors[1], None, Some(d1)).unwrap(), None);
        assert_eq!(c.registry().target().position, Position::ORIGIN);
        assert_eq!(c.registry().target().insufficient_data, 2);

        let solution = c.record_measurement(&anchors[2], None, Some(d2)).unwrap().unwrap();
        assert!(solution.converged);
        assert!(solution.position.distance_to(&target) < 0.01);
        assert_eq!(c.registry().target().position, solution.position);
    }

    #[test]
    fn test_insufficient_data_keeps_prior_fix() {
        let c = coordinator();
        let a = place(&c, "mac-a", Position::new(0.0, 0.0, 0.0));
        let b = place(&c, "mac-b", Position::new(4.0, 0.0, 0.0));
        let d = place(&c, "mac-c", Position::new(0.0, 4.0, 0.0));

        c.record_measurement(&a, None, Some(5f64.sqrt())).unwrap();
        c.record_measurement(&b, None, Some(5f64.sqrt())).unwrap();
        c.record_measurement(&d, None, Some(13f64.sqrt())).unwrap();
        let fix = c.registry().target().position;

        // Anchor c loses its distance: two eligible anchors remain
        c.record_measurement(&d, None, Some(0.0)).unwrap();
        assert!(matches!(
            c.recompute(),
            Err(SolveError::InsufficientAnchors { available: 2, required: 3 })
        ));
        assert_eq!(c.registry().target().position, fix);
    }

    #[test]
    fn test_rssi_report_uses_anchor_calibration() {
        let c = coordinator();
        let a = place(&c, "mac-a", Position::ORIGIN);
        c.set_anchor_calibration(&a, Calibration::new(-40.0, 2.0)).unwrap();

        c.record_measurement(&a, Some(-60.0), None).unwrap();
        let anchor = c.registry().anchor(&a).unwrap();
        assert!((anchor.last_distance.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_anchor_admin_writes() {
        let c = coordinator();
        assert!(c.set_anchor_position("anchor-42", Position::ORIGIN).is_err());
        assert!(c.set_anchor_calibration("anchor-42", Calibration::default()).is_err());
        assert!(c.record_measurement("anchor-42", None, Some(1.0)).is_err());
        assert!(c.registry().is_empty());
    }

    #[tokio::test]
    async fn test_register_closes_displaced_connection() {
        let c = coordinator();
        let first = c.open_connection();
        let second = c.open_connection();

        let reg1 = c.register(first.id, "mac-a", None, ReplyStyle::Json);
        let reg2 = c.register(second.id, "mac-a", None, ReplyStyle::Json);
        assert_eq!(reg1.anchor_id, reg2.anchor_id);
        assert_eq!(reg2.displaced, Some(first.id));

        // The notify permit is stored, so this resolves immediately
        tokio::time::timeout(Duration::from_secs(1), first.closed.notified())
            .await
            .unwrap();

        c.close_connection(first.id, Some(&reg1.anchor_id));
        let anchor = c.registry().anchor(&reg1.anchor_id).unwrap();
        assert_eq!(anchor.connection, Some(second.id));
        assert_eq!(c.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_register_broadcasts_node_list() {
        let c = coordinator();
        let mut first = c.open_connection();
        let mut second = c.open_connection();

        c.register(first.id, "mac-a", None, ReplyStyle::Json);
        c.register(second.id, "mac-b", None, ReplyStyle::Legacy);

        assert_eq!(
            first.outbound_rx.recv().await.unwrap(),
            Outbound::Message(ServiceMessage::IdAssignment {
                id: "anchor-1".into()
            })
        );
        // First connection sees both lists; the latest has two nodes
        let _ = first.outbound_rx.recv().await.unwrap();
        match first.outbound_rx.recv().await.unwrap() {
            Outbound::Message(ServiceMessage::NodeList { nodes }) => {
                assert_eq!(nodes.len(), 2);
                assert_eq!(nodes[1].mac, "mac-b");
            }
            other => panic!("Expected node list, got {:?}", other),
        }
        assert_eq!(
            second.outbound_rx.recv().await.unwrap(),
            Outbound::LegacyId("anchor-2".into())
        );
        match second.outbound_rx.recv().await.unwrap() {
            Outbound::Message(ServiceMessage::NodeList { nodes }) => assert_eq!(nodes.len(), 2),
            other => panic!("Expected node list, got {:?}", other),
        }
    }

    #[test]
    fn test_rekey_releases_previous_anchor() {
        let c = coordinator();
        let mut conn = c.open_connection();
        let fallback = c.register(conn.id, "ESP_10_0_0_7", None, ReplyStyle::Legacy);
        let real = c.register(
            conn.id,
            "AA:BB:CC",
            Some(&fallback.anchor_id),
            ReplyStyle::Json,
        );

        assert_ne!(fallback.anchor_id, real.anchor_id);
        let old = c.registry().anchor(&fallback.anchor_id).unwrap();
        assert_eq!(old.connection, None);
        let new = c.registry().anchor(&real.anchor_id).unwrap();
        assert_eq!(new.connection, Some(conn.id));

        // The abandoned fallback identity drops out of the peer list
        assert!(old.retired);
        let mut last_list = None;
        while let Ok(frame) = conn.outbound_rx.try_recv() {
            if let Outbound::Message(ServiceMessage::NodeList { nodes }) = frame {
                last_list = Some(nodes);
            }
        }
        let nodes = last_list.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, real.anchor_id);
    }

    #[test]
    fn test_last_fix_warm_start() {
        let config = ServerConfig::default()
            .with_max_measurement_age(None)
            .with_initial_guess(InitialGuess::LastFix);
        let c = Coordinator::new(config);
        let target = Position::new(2.0, 1.0, 0.0);
        let positions = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(4.0, 0.0, 0.0),
            Position::new(0.0, 4.0, 0.0),
        ];
        let mut first = None;
        for (i, p) in positions.iter().enumerate() {
            let id = place(&c, &format!("mac-{}", i), *p);
            first = c.record_measurement(&id, None, Some(p.distance_to(&target))).unwrap();
        }

        // No earlier fix: the first solve starts at the origin
        let first = first.unwrap();
        assert!(first.converged);
        assert!(first.iterations > 10);

        let second = c.recompute().unwrap();
        assert!(second.converged);
        assert!(second.iterations < first.iterations);
        assert_eq!(second.iterations, 1);
        assert!(second.position.distance_to(&target) < 0.01);
    }

    #[test]
    fn test_centroid_initial_guess() {
        let config = ServerConfig::default()
            .with_max_measurement_age(None)
            .with_initial_guess(InitialGuess::Centroid);
        let c = Coordinator::new(config);
        let target = Position::new(1.5, 3.5, 0.0);
        let positions = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(5.0, 0.0, 0.0),
            Position::new(0.0, 5.0, 0.0),
            Position::new(5.0, 5.0, 0.0),
        ];
        let mut solution = None;
        for (i, p) in positions.iter().enumerate() {
            let id = place(&c, &format!("mac-{}", i), *p);
            solution = c.record_measurement(&id, None, Some(p.distance_to(&target))).unwrap();
        }

        let solution = solution.unwrap();
        assert!(solution.converged);
        assert!(solution.position.distance_to(&target) < 0.01);
    }

    #[test]
    fn test_custom_solver_never_sees_fewer_than_three_anchors() {
        struct Fixed {
            calls: AtomicUsize,
        }
        impl PositionSolver for Fixed {
            fn solve(
                &self,
                observations: &[trilat_core::RangeObservation],
                _initial_guess: Position,
            ) -> Result<Solution, SolveError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Solution {
                    position: Position::new(9.0, 9.0, 9.0),
                    iterations: 0,
                    converged: true,
                    residual: 0.0,
                    anchors_used: observations.len(),
                })
            }
        }

        let solver = Arc::new(Fixed {
            calls: AtomicUsize::new(0),
        });
        struct Shared(Arc<Fixed>);
        impl PositionSolver for Shared {
            fn solve(
                &self,
                observations: &[trilat_core::RangeObservation],
                initial_guess: Position,
            ) -> Result<Solution, SolveError> {
                self.0.solve(observations, initial_guess)
            }
        }

        let config = ServerConfig::default()
            .with_max_measurement_age(None)
            .with_solver(SolverConfig {
                min_anchors: 1,
                ..SolverConfig::default()
            });
        let c = Coordinator::with_solver(config, Box::new(Shared(solver.clone())));

        let a = place(&c, "mac-a", Position::new(4.0, 0.0, 0.0));
        let b = place(&c, "mac-b", Position::new(0.0, 4.0, 0.0));
        assert_eq!(c.record_measurement(&a, None, Some(1.0)).unwrap(), None);
        assert_eq!(c.record_measurement(&b, None, Some(1.0)).unwrap(), None);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(c.registry().target().position, Position::ORIGIN);
        assert_eq!(c.registry().target().insufficient_data, 2);

        let d = place(&c, "mac-c", Position::ORIGIN);
        let solution = c.record_measurement(&d, None, Some(1.0)).unwrap().unwrap();
        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(solution.anchors_used, 3);
        assert_eq!(c.registry().target().position, Position::new(9.0, 9.0, 9.0));
    }
}
