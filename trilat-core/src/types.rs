//! Core types for the positioning service

use serde::{Deserialize, Serialize};

/// Identifier assigned to an anchor at first registration
pub type AnchorId = String;

/// Durable hardware identity of an anchor (MAC address or derived fallback)
pub type HardwareId = String;

/// Identifier of a single transport connection
pub type ConnectionId = u64;

/// Identifier of the single tracked target
pub const TARGET_ID: &str = "PHONE";

/// Point in 3D space, in meters
///
/// Serialized with upper-case axis names to match the anchor firmware
/// and visualization client.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another point
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Arithmetic mean of a set of points, `None` when empty
    pub fn centroid<'a>(points: impl IntoIterator<Item = &'a Position>) -> Option<Position> {
        let mut sum = Position::ORIGIN;
        let mut count = 0usize;
        for p in points {
            sum.x += p.x;
            sum.y += p.y;
            sum.z += p.z;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some(Position::new(sum.x / n, sum.y / n, sum.z / n))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Per-anchor log-distance path loss calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Expected RSSI at 1 meter, in dBm
    #[serde(rename = "rssi_at_1m")]
    pub reference_rssi: f64,
    /// Environment attenuation factor (2.0 free space, up to ~4.0 indoors)
    #[serde(rename = "path_loss")]
    pub path_loss_exponent: f64,
}

impl Calibration {
    pub fn new(reference_rssi: f64, path_loss_exponent: f64) -> Self {
        Self {
            reference_rssi,
            path_loss_exponent,
        }
    }

    /// A usable calibration has finite values and a positive exponent
    pub fn is_valid(&self) -> bool {
        self.reference_rssi.is_finite()
            && self.path_loss_exponent.is_finite()
            && self.path_loss_exponent > 0.0
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            reference_rssi: -60.0,
            path_loss_exponent: 2.0,
        }
    }
}

/// Liveness of an anchor's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Derive the legacy hardware identity from a peer IP address
///
/// Older firmware never sends a MAC, so it is keyed by its address with
/// separators replaced: `192.168.1.5` becomes `ESP_192_168_1_5`.
pub fn fallback_hardware_id(ip: &std::net::IpAddr) -> HardwareId {
    let clean = ip.to_string().replace(['.', ':'], "_");
    format!("ESP_{}", clean)
}
