//! Anchor registry
//!
//! Owns every anchor record and the single target record behind one
//! reader/writer lock. Mutations hold the write lock for their full duration;
//! snapshots take the read lock and hand back owned copies, so readers never
//! observe a half-written record and never hold the lock while they work.
//!
//! Records are never deleted. A disconnect only clears the connection handle,
//! leaving position and calibration in place for the next reconnect.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::signal;
use crate::solver::{RangeObservation, Solution};
use crate::types::*;

/// A fixed sensing node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anchor {
    pub id: AnchorId,
    pub hardware_id: HardwareId,
    /// Registration order, used for stable listings
    #[serde(skip)]
    pub seq: u64,
    pub position: Position,
    /// Anchor-specific calibration; `None` means the registry default applies
    pub calibration: Option<Calibration>,
    pub last_rssi: Option<f64>,
    /// Last usable distance estimate in meters
    pub last_distance: Option<f64>,
    pub last_measured: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    pub connection: Option<ConnectionId>,
    /// Identity abandoned by its connection for another one; hidden from
    /// peer and viewer listings until registered again
    pub retired: bool,
}

impl Anchor {
    fn new(id: AnchorId, hardware_id: HardwareId, seq: u64, connection: ConnectionId) -> Self {
        Self {
            id,
            hardware_id,
            seq,
            position: Position::ORIGIN,
            calibration: None,
            last_rssi: None,
            last_distance: None,
            last_measured: None,
            last_seen: Utc::now(),
            connection: Some(connection),
            retired: false,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.connection.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Has a positive distance that is not older than `max_age`
    pub fn is_eligible(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        let Some(distance) = self.last_distance else {
            return false;
        };
        if !signal::is_usable_distance(distance) {
            return false;
        }
        match (max_age, self.last_measured) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(age), Some(measured)) => match chrono::Duration::from_std(age) {
                Ok(age) => now.signed_duration_since(measured) <= age,
                Err(_) => true,
            },
        }
    }
}

/// The tracked mobile device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub id: String,
    pub position: Position,
    pub updated_at: Option<DateTime<Utc>>,
    /// Diagnostics of the solve that produced `position`
    pub last_solution: Option<Solution>,
    /// Solve attempts skipped for lack of eligible anchors
    pub insufficient_data: u64,
    /// Measurement generation the published fix was solved from
    pub generation: u64,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: TARGET_ID.to_string(),
            position: Position::ORIGIN,
            updated_at: None,
            last_solution: None,
            insufficient_data: 0,
            generation: 0,
        }
    }
}

/// Outcome of [`Registry::register_or_reuse`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub anchor_id: AnchorId,
    /// A new record was allocated
    pub created: bool,
    /// Connection that held this identity before and must be closed
    pub displaced: Option<ConnectionId>,
}

/// Outcome of [`Registry::record_measurement`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementOutcome {
    /// Distance stored for the anchor, if usable
    pub distance: Option<f64>,
}

impl MeasurementOutcome {
    pub fn has_distance(&self) -> bool {
        self.distance.is_some()
    }
}

/// Eligible ranges copied out for one solve
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSet {
    /// Registry generation the copy was taken at
    pub generation: u64,
    pub observations: Vec<RangeObservation>,
}

/// Read-only copy of the registry
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub anchors: Vec<Anchor>,
    pub target: Target,
    pub taken_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn connected_count(&self) -> usize {
        self.anchors
            .iter()
            .filter(|a| a.connection_state() == ConnectionState::Connected)
            .count()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    anchors: HashMap<AnchorId, Anchor>,
    by_hardware: HashMap<HardwareId, AnchorId>,
    next_seq: u64,
    /// Bumped by every write that changes solver input
    generation: u64,
    target: Target,
}

impl RegistryInner {
    fn anchor_mut(&mut self, anchor_id: &str) -> Result<&mut Anchor, RegistryError> {
        self.anchors
            .get_mut(anchor_id)
            .ok_or_else(|| RegistryError::UnknownAnchor(anchor_id.to_string()))
    }
}

/// Concurrent-safe anchor and target store
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
    default_calibration: Calibration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Calibration::default())
    }
}

impl Registry {
    pub fn new(default_calibration: Calibration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            default_calibration,
        }
    }

    pub fn default_calibration(&self) -> Calibration {
        self.default_calibration
    }

    /// Find the anchor for a hardware identity or allocate a new one
    ///
    /// Either way `connection` becomes the anchor's active handle. The
    /// previous handle, if different, is returned so the caller can close it.
    pub fn register_or_reuse(&self, hardware_id: &str, connection: ConnectionId) -> Registration {
        let mut inner = self.inner.write();

        if let Some(anchor_id) = inner.by_hardware.get(hardware_id).cloned() {
            if let Some(anchor) = inner.anchors.get_mut(&anchor_id) {
                let displaced = anchor.connection.filter(|c| *c != connection);
                anchor.connection = Some(connection);
                anchor.last_seen = Utc::now();
                anchor.retired = false;

                if displaced.is_some() {
                    info!("Anchor {} reconnected with new connection", anchor_id);
                } else {
                    debug!("Anchor {} re-registered ({})", anchor_id, hardware_id);
                }

                return Registration {
                    anchor_id,
                    created: false,
                    displaced,
                };
            }
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        let anchor_id = format!("anchor-{}", seq);
        inner.anchors.insert(
            anchor_id.clone(),
            Anchor::new(anchor_id.clone(), hardware_id.to_string(), seq, connection),
        );
        inner
            .by_hardware
            .insert(hardware_id.to_string(), anchor_id.clone());

        info!("Registered anchor {} for {}", anchor_id, hardware_id);

        Registration {
            anchor_id,
            created: true,
            displaced: None,
        }
    }

    /// Refresh an anchor's liveness timestamp
    pub fn touch(&self, anchor_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        inner.anchor_mut(anchor_id)?.last_seen = Utc::now();
        Ok(())
    }

    /// Store the latest RSSI and distance for an anchor
    ///
    /// A usable reported distance wins; otherwise the distance is derived from
    /// the RSSI through the anchor's calibration. Last value wins, so a report
    /// with no usable distance leaves the anchor ineligible.
    pub fn record_measurement(
        &self,
        anchor_id: &str,
        rssi: Option<f64>,
        distance: Option<f64>,
    ) -> Result<MeasurementOutcome, RegistryError> {
        let mut inner = self.inner.write();
        let default = self.default_calibration;
        let anchor = inner.anchor_mut(anchor_id)?;

        let resolved = distance
            .filter(|d| signal::is_usable_distance(*d))
            .or_else(|| {
                rssi.filter(|r| r.is_finite())
                    .map(|r| signal::distance_or_default(r, anchor.calibration.as_ref(), &default))
                    .filter(|d| signal::is_usable_distance(*d))
            });

        let now = Utc::now();
        anchor.last_rssi = rssi;
        anchor.last_distance = resolved;
        anchor.last_measured = Some(now);
        anchor.last_seen = now;
        inner.generation += 1;

        Ok(MeasurementOutcome { distance: resolved })
    }

    /// Administrative position write
    pub fn set_position(&self, anchor_id: &str, position: Position) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        inner.anchor_mut(anchor_id)?.position = position;
        inner.generation += 1;
        Ok(())
    }

    /// Administrative calibration write
    pub fn set_calibration(
        &self,
        anchor_id: &str,
        calibration: Calibration,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        inner.anchor_mut(anchor_id)?.calibration = Some(calibration);
        Ok(())
    }

    /// Calibration in effect for an anchor
    pub fn calibration_for(&self, anchor_id: &str) -> Result<Calibration, RegistryError> {
        let inner = self.inner.read();
        inner
            .anchors
            .get(anchor_id)
            .map(|a| a.calibration.unwrap_or(self.default_calibration))
            .ok_or_else(|| RegistryError::UnknownAnchor(anchor_id.to_string()))
    }

    /// Clear the connection handle if `connection` is still the active one
    ///
    /// Returns `false` when a newer connection has taken over the identity.
    pub fn mark_disconnected(&self, anchor_id: &str, connection: ConnectionId) -> bool {
        let mut inner = self.inner.write();
        match inner.anchors.get_mut(anchor_id) {
            Some(anchor) if anchor.connection == Some(connection) => {
                anchor.connection = None;
                info!("Anchor {} marked as disconnected", anchor_id);
                true
            }
            _ => false,
        }
    }

    /// Hide an identity its connection moved away from
    pub fn retire(&self, anchor_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let anchor = inner.anchor_mut(anchor_id)?;
        if anchor.connection.is_none() {
            anchor.retired = true;
            debug!("Anchor {} retired", anchor_id);
        }
        Ok(())
    }

    /// Copy of the ranges usable for solving
    pub fn eligible_observations(
        &self,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
    ) -> Vec<RangeObservation> {
        self.observation_set(now, max_age).observations
    }

    /// Eligible ranges together with the generation they were read at
    pub fn observation_set(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> ObservationSet {
        let inner = self.inner.read();
        let mut eligible: Vec<&Anchor> = inner
            .anchors
            .values()
            .filter(|a| a.is_eligible(now, max_age))
            .collect();
        eligible.sort_by_key(|a| a.seq);

        let observations = eligible
            .into_iter()
            .filter_map(|a| a.last_distance.map(|d| RangeObservation::new(a.position, d)))
            .collect();

        ObservationSet {
            generation: inner.generation,
            observations,
        }
    }

    pub fn target(&self) -> Target {
        self.inner.read().target.clone()
    }

    /// Publish a new target fix
    ///
    /// A fix solved from an older generation than the published one is
    /// dropped and `false` is returned.
    pub fn update_target(&self, solution: Solution, generation: u64) -> bool {
        let mut inner = self.inner.write();
        if generation < inner.target.generation {
            debug!(
                "Dropping stale fix from generation {} (published {})",
                generation, inner.target.generation
            );
            return false;
        }
        inner.target.position = solution.position;
        inner.target.updated_at = Some(Utc::now());
        inner.target.last_solution = Some(solution);
        inner.target.generation = generation;
        true
    }

    /// Count a solve skipped for lack of data; the position is untouched
    pub fn record_insufficient_data(&self) {
        self.inner.write().target.insufficient_data += 1;
    }

    pub fn anchor(&self, anchor_id: &str) -> Option<Anchor> {
        self.inner.read().anchors.get(anchor_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of every anchor and the target, in registration order
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let mut anchors: Vec<Anchor> = inner.anchors.values().cloned().collect();
        anchors.sort_by_key(|a| a.seq);

        RegistrySnapshot {
            anchors,
            target: inner.target.clone(),
            taken_at: Utc::now(),
        }
    }
}
