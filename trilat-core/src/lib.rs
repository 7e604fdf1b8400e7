//! Trilateration Core Library
//!
//! Positioning domain for a fixed set of RSSI anchors tracking one target.
//! Holds the signal model, the multilateration solver, the anchor registry
//! and the per-connection session protocol; the transport lives elsewhere.

pub mod types;
pub mod error;
pub mod signal;
pub mod solver;
pub mod registry;
pub mod protocol;
pub mod session;

pub use types::*;
pub use error::{ProtocolError, RegistryError, SessionError, SolveError};
pub use registry::{
    Anchor, MeasurementOutcome, ObservationSet, Registration, Registry, RegistrySnapshot, Target,
};
pub use solver::{GradientDescent, InitialGuess, PositionSolver, RangeObservation, Solution, SolverConfig};
pub use session::{Action, ReplyStyle, Session, SessionEvent, SessionState};
pub use protocol::{AnchorMessage, Inbound, Outbound, ServiceMessage};
