//! Per-connection session state machine
//!
//! ```text
//! Connecting ──TransportReady──► AwaitingIdentity ──IdentityConfirmed──► Active
//!      │                               │                                 │  ▲
//!      │                               │                IdentityConfirmed└──┘
//!      └────────── TransportClosed ────┴──────────── TransportClosed ────► Closed
//! ```
//!
//! Closed is terminal. A reconnecting anchor gets a fresh session and finds its
//! registry record again through its hardware id.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{select_measurement, AnchorMessage, Inbound, LegacyCommand};
use crate::types::*;

/// Lifecycle state of one anchor connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport handshake in progress
    Connecting,
    /// Transport up, no confirmed anchor id yet
    AwaitingIdentity,
    /// Identity confirmed, reports accepted
    Active,
    /// Transport gone
    Closed,
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    TransportReady,
    IdentityConfirmed { anchor_id: AnchorId, hardware_id: HardwareId },
    TransportClosed,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::TransportReady => write!(f, "TransportReady"),
            SessionEvent::IdentityConfirmed { anchor_id, .. } => {
                write!(f, "IdentityConfirmed({})", anchor_id)
            }
            SessionEvent::TransportClosed => write!(f, "TransportClosed"),
        }
    }
}

/// Transition table
pub fn next_state(from: SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionState::*;

    match (from, event) {
        (Connecting, SessionEvent::TransportReady) => Some(AwaitingIdentity),
        (AwaitingIdentity, SessionEvent::IdentityConfirmed { .. }) => Some(Active),
        (Active, SessionEvent::IdentityConfirmed { .. }) => Some(Active),
        (Connecting | AwaitingIdentity | Active, SessionEvent::TransportClosed) => Some(Closed),
        _ => None,
    }
}

/// Which dialect a reply must use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStyle {
    Json,
    Legacy,
}

/// What the service should do with an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Register or reuse the identity and confirm it to the anchor
    Register { hardware_id: HardwareId, style: ReplyStyle },
    /// Store a measurement and maybe re-solve
    Measurement { rssi: Option<f64>, distance: Option<f64> },
    SetPosition(Position),
    SetCalibration(Calibration),
    Pong(ReplyStyle),
    /// Drop the frame without changing any state
    Discard(&'static str),
}

/// State of one anchor connection
#[derive(Debug)]
pub struct Session {
    pub connection: ConnectionId,
    /// Identity used when the anchor never presents a MAC
    pub fallback_hardware_id: HardwareId,
    pub state: SessionState,
    pub anchor_id: Option<AnchorId>,
    pub hardware_id: Option<HardwareId>,
    pub opened_at: DateTime<Utc>,
    pub frames_received: u64,
    pub frames_discarded: u64,
}

impl Session {
    pub fn new(connection: ConnectionId, fallback_hardware_id: impl Into<HardwareId>) -> Self {
        Self {
            connection,
            fallback_hardware_id: fallback_hardware_id.into(),
            state: SessionState::Connecting,
            anchor_id: None,
            hardware_id: None,
            opened_at: Utc::now(),
            frames_received: 0,
            frames_discarded: 0,
        }
    }

    /// Apply an event, rejecting transitions the table does not allow
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<SessionState, SessionError> {
        debug!("Session {} event: {}", self.connection, event);

        let next = next_state(self.state, &event).ok_or_else(|| SessionError::InvalidTransition {
            from: self.state,
            event: event.clone(),
        })?;

        match event {
            SessionEvent::TransportReady => {
                debug!("Session {} awaiting identity", self.connection);
            }
            SessionEvent::IdentityConfirmed {
                anchor_id,
                hardware_id,
            } => {
                if self.anchor_id.as_deref() != Some(anchor_id.as_str()) {
                    info!(
                        "Session {} confirmed as {} ({})",
                        self.connection, anchor_id, hardware_id
                    );
                }
                self.anchor_id = Some(anchor_id);
                self.hardware_id = Some(hardware_id);
            }
            SessionEvent::TransportClosed => {
                info!(
                    "Session {} closed after {} frames",
                    self.connection, self.frames_received
                );
            }
        }

        self.state = next;
        Ok(next)
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_awaiting_identity(&self) -> bool {
        self.state == SessionState::AwaitingIdentity
    }

    /// Decide how to handle a decoded frame in the current state
    pub fn dispatch(&mut self, inbound: Inbound, target_filter: Option<&str>) -> Action {
        self.frames_received += 1;
        let action = self.classify(inbound, target_filter);
        if let Action::Discard(reason) = &action {
            self.frames_discarded += 1;
            debug!("Session {} discarded frame: {}", self.connection, reason);
        }
        action
    }

    fn classify(&self, inbound: Inbound, target_filter: Option<&str>) -> Action {
        if !matches!(self.state, SessionState::AwaitingIdentity | SessionState::Active) {
            return Action::Discard("session not open");
        }

        let msg = match inbound {
            Inbound::Legacy(LegacyCommand::Ping) => return Action::Pong(ReplyStyle::Legacy),
            Inbound::Legacy(LegacyCommand::Register) => {
                return Action::Register {
                    hardware_id: self.fallback_hardware_id.clone(),
                    style: ReplyStyle::Legacy,
                }
            }
            Inbound::Message(msg) => msg,
        };

        if msg.is_report() && !self.is_active() {
            warn!(
                "Session {} sent {} before identity was confirmed",
                self.connection,
                msg.kind()
            );
            return Action::Discard("identity not confirmed");
        }

        match msg {
            AnchorMessage::Register { mac } => {
                if mac.trim().is_empty() {
                    return Action::Discard("empty hardware id");
                }
                Action::Register {
                    hardware_id: mac,
                    style: ReplyStyle::Json,
                }
            }
            AnchorMessage::Ping => Action::Pong(ReplyStyle::Json),
            AnchorMessage::Distance { rssi, distance } => {
                if rssi.is_none() && distance.is_none() {
                    return Action::Discard("empty distance report");
                }
                Action::Measurement { rssi, distance }
            }
            AnchorMessage::RssiReport {
                node_id,
                measurements,
                ..
            } => {
                if let (Some(claimed), Some(own)) = (node_id.as_deref(), self.anchor_id.as_deref()) {
                    if claimed != own {
                        warn!(
                            "Session {} reported as {} but is confirmed as {}",
                            self.connection, claimed, own
                        );
                    }
                }
                match select_measurement(&measurements, target_filter) {
                    Some(m) => Action::Measurement {
                        rssi: Some(m.rssi),
                        distance: None,
                    },
                    None => Action::Discard("no usable measurement"),
                }
            }
            AnchorMessage::Position { x, y, z } => {
                let position = Position::new(x, y, z);
                if position.is_finite() {
                    Action::SetPosition(position)
                } else {
                    Action::Discard("non-finite position")
                }
            }
            AnchorMessage::Calibration {
                rssi_at_1m,
                path_loss,
            } => {
                let calibration = Calibration::new(rssi_at_1m, path_loss);
                if calibration.is_valid() {
                    Action::SetCalibration(calibration)
                } else {
                    Action::Discard("invalid calibration")
                }
            }
        }
    }
}
