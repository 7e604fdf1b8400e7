//! Anchor wire protocol
//!
//! Anchors speak two dialects over the same text channel:
//! - JSON frames tagged by a `type` field (current firmware)
//! - Bare text commands `PING` / `REGISTER`, answered with `PONG` / `ID:<id>`
//!
//! | type | direction | effect |
//! |------|-----------|--------|
//! | `register` | anchor → service | allocate or reuse an anchor id |
//! | `id_assignment` | service → anchor | confirm identity |
//! | `node_list` | service → anchor | known peers |
//! | `rssi_report` / `distance` | anchor → service | measurement, may trigger a solve |
//! | `position` | anchor → service | administrative position update |
//! | `calibration` | anchor → service | per-anchor calibration update |

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{AnchorId, Calibration, HardwareId, Position};

pub const LEGACY_PING: &str = "PING";
pub const LEGACY_PONG: &str = "PONG";
pub const LEGACY_REGISTER: &str = "REGISTER";
pub const LEGACY_ID_PREFIX: &str = "ID:";

/// One RSSI reading towards a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMeasurement {
    pub target_id: String,
    pub rssi: f64,
}

/// Messages sent by anchors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnchorMessage {
    /// Request an identity for a hardware address
    Register { mac: HardwareId },

    /// Batched RSSI readings
    RssiReport {
        #[serde(default)]
        node_id: Option<AnchorId>,
        #[serde(default)]
        timestamp: Option<u64>,
        #[serde(default)]
        measurements: Vec<TargetMeasurement>,
    },

    /// Single reading with an optional precomputed distance
    #[serde(alias = "distance_report")]
    Distance {
        #[serde(default)]
        rssi: Option<f64>,
        #[serde(default)]
        distance: Option<f64>,
    },

    /// The anchor's own fixed position
    Position {
        #[serde(rename = "X")]
        x: f64,
        #[serde(rename = "Y")]
        y: f64,
        #[serde(rename = "Z")]
        z: f64,
    },

    /// The anchor's own calibration pair
    Calibration { rssi_at_1m: f64, path_loss: f64 },

    /// Liveness probe
    Ping,
}

impl AnchorMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            AnchorMessage::Register { .. } => "register",
            AnchorMessage::RssiReport { .. } => "rssi_report",
            AnchorMessage::Distance { .. } => "distance",
            AnchorMessage::Position { .. } => "position",
            AnchorMessage::Calibration { .. } => "calibration",
            AnchorMessage::Ping => "ping",
        }
    }

    /// Position carried by a `position` message
    pub fn position(&self) -> Option<Position> {
        match self {
            AnchorMessage::Position { x, y, z } => Some(Position::new(*x, *y, *z)),
            _ => None,
        }
    }

    /// Calibration carried by a `calibration` message
    pub fn calibration(&self) -> Option<Calibration> {
        match self {
            AnchorMessage::Calibration {
                rssi_at_1m,
                path_loss,
            } => Some(Calibration::new(*rssi_at_1m, *path_loss)),
            _ => None,
        }
    }

    /// Whether this message carries a measurement and needs a confirmed identity
    pub fn is_report(&self) -> bool {
        !matches!(self, AnchorMessage::Register { .. } | AnchorMessage::Ping)
    }
}

/// Peer entry in a `node_list` broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: AnchorId,
    pub mac: HardwareId,
}

/// Messages sent by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    IdAssignment { id: AnchorId },
    NodeList { nodes: Vec<NodeEntry> },
    Pong,
}

/// Bare text commands from older firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyCommand {
    Ping,
    Register,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(AnchorMessage),
    Legacy(LegacyCommand),
}

/// A frame queued for an anchor
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServiceMessage),
    LegacyPong,
    LegacyId(AnchorId),
}

impl Outbound {
    /// Wire text for this frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            Outbound::Message(msg) => serde_json::to_string(msg),
            Outbound::LegacyPong => Ok(LEGACY_PONG.to_string()),
            Outbound::LegacyId(id) => Ok(format!("{}{}", LEGACY_ID_PREFIX, id)),
        }
    }
}

/// Decode one text frame
///
/// Frames that look like JSON must decode as an [`AnchorMessage`]; anything
/// else is matched against the legacy commands.
pub fn parse_frame(text: &str) -> Result<Inbound, ProtocolError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }

    if trimmed.starts_with('{') {
        let msg: AnchorMessage = serde_json::from_str(trimmed)?;
        return Ok(Inbound::Message(msg));
    }

    match trimmed {
        LEGACY_PING => Ok(Inbound::Legacy(LegacyCommand::Ping)),
        LEGACY_REGISTER => Ok(Inbound::Legacy(LegacyCommand::Register)),
        other => Err(ProtocolError::UnknownText(other.to_string())),
    }
}

/// Pick the reading to use from an `rssi_report`
///
/// With a filter, only the matching target counts; without one the strongest
/// reading wins.
pub fn select_measurement<'a>(
    measurements: &'a [TargetMeasurement],
    target_filter: Option<&str>,
) -> Option<&'a TargetMeasurement> {
    let finite = measurements.iter().filter(|m| m.rssi.is_finite());
    match target_filter {
        Some(target) => finite.filter(|m| m.target_id == target).last(),
        None => finite.max_by(|a, b| a.rssi.total_cmp(&b.rssi)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let parsed = parse_frame(r#"{"type":"register","mac":"AA:BB:CC:00:11:22"}"#).unwrap();
        assert_eq!(
            parsed,
            Inbound::Message(AnchorMessage::Register {
                mac: "AA:BB:CC:00:11:22".to_string()
            })
        );
    }

    #[test]
    fn test_parse_distance_report() {
        let parsed = parse_frame(r#"{"type":"distance","node_id":"x","rssi":-67,"distance":2.24}"#)
            .unwrap();
        assert_eq!(
            parsed,
            Inbound::Message(AnchorMessage::Distance {
                rssi: Some(-67.0),
                distance: Some(2.24)
            })
        );

        let rssi_only = parse_frame(r#"{"type":"distance_report","rssi":-70}"#).unwrap();
        assert_eq!(
            rssi_only,
            Inbound::Message(AnchorMessage::Distance {
                rssi: Some(-70.0),
                distance: None
            })
        );
    }

    #[test]
    fn test_parse_rssi_report() {
        let text = r#"{
            "type": "rssi_report",
            "node_id": "anchor-2",
            "timestamp": 123456,
            "measurements": [
                {"target_id": "PHONE", "rssi": -71},
                {"target_id": "TABLET", "rssi": -55}
            ]
        }"#;
        match parse_frame(text).unwrap() {
            Inbound::Message(AnchorMessage::RssiReport {
                node_id,
                timestamp,
                measurements,
            }) => {
                assert_eq!(node_id.as_deref(), Some("anchor-2"));
                assert_eq!(timestamp, Some(123456));
                assert_eq!(measurements.len(), 2);
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_position_and_calibration() {
        let pos = parse_frame(r#"{"type":"position","X":1.5,"Y":2,"Z":0.5}"#).unwrap();
        let Inbound::Message(msg) = pos else {
            panic!("expected message");
        };
        assert_eq!(msg.position(), Some(Position::new(1.5, 2.0, 0.5)));

        let cal = parse_frame(r#"{"type":"calibration","rssi_at_1m":-58,"path_loss":2.7}"#).unwrap();
        let Inbound::Message(msg) = cal else {
            panic!("expected message");
        };
        assert_eq!(msg.calibration(), Some(Calibration::new(-58.0, 2.7)));
    }

    #[test]
    fn test_parse_legacy_commands() {
        assert_eq!(parse_frame("PING").unwrap(), Inbound::Legacy(LegacyCommand::Ping));
        assert_eq!(parse_frame("REGISTER\n").unwrap(), Inbound::Legacy(LegacyCommand::Register));
        assert!(matches!(parse_frame("HELLO"), Err(ProtocolError::UnknownText(_))));
        assert!(matches!(parse_frame("   "), Err(ProtocolError::Empty)));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(parse_frame("{not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            parse_frame(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"register"}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_outbound_encoding() {
        let id = Outbound::Message(ServiceMessage::IdAssignment {
            id: "anchor-1".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&id.to_text().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "id_assignment", "id": "anchor-1"}));

        let list = Outbound::Message(ServiceMessage::NodeList {
            nodes: vec![NodeEntry {
                id: "anchor-1".to_string(),
                mac: "AA".to_string(),
            }],
        });
        let json: serde_json::Value = serde_json::from_str(&list.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "node_list");
        assert_eq!(json["nodes"][0]["mac"], "AA");

        assert_eq!(Outbound::LegacyPong.to_text().unwrap(), "PONG");
        assert_eq!(Outbound::LegacyId("anchor-3".into()).to_text().unwrap(), "ID:anchor-3");
    }

    #[test]
    fn test_select_measurement() {
        let readings = vec![
            TargetMeasurement { target_id: "PHONE".into(), rssi: -71.0 },
            TargetMeasurement { target_id: "TABLET".into(), rssi: -55.0 },
        ];
        assert_eq!(select_measurement(&readings, None).unwrap().target_id, "TABLET");
        assert_eq!(select_measurement(&readings, Some("PHONE")).unwrap().rssi, -71.0);
        assert!(select_measurement(&readings, Some("WATCH")).is_none());
        assert!(select_measurement(&[], None).is_none());
    }

    #[test]
    fn test_report_classification() {
        assert!(!AnchorMessage::Ping.is_report());
        assert!(!AnchorMessage::Register { mac: "m".into() }.is_report());
        assert!(AnchorMessage::Distance { rssi: None, distance: Some(1.0) }.is_report());
    }
}
