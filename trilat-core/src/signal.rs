//! Log-distance path loss model
//!
//! Converts a received signal strength into an estimated distance:
//!
//! ```text
//! distance = 10 ^ ((rssi_at_1m - rssi) / (10 * path_loss))
//! ```

use crate::types::Calibration;

/// Estimated distance in meters for an RSSI reading under a calibration
///
/// Finite inputs with a positive exponent give a finite positive result.
/// Callers still gate on [`is_usable_distance`] before solving, since an
/// extreme reading can overflow to infinity or underflow to zero.
pub fn distance(rssi: f64, calibration: &Calibration) -> f64 {
    let exponent =
        (calibration.reference_rssi - rssi) / (10.0 * calibration.path_loss_exponent);
    10f64.powf(exponent)
}

/// Distance using a per-anchor calibration when present, else the default pair
pub fn distance_or_default(rssi: f64, calibration: Option<&Calibration>, default: &Calibration) -> f64 {
    distance(rssi, calibration.unwrap_or(default))
}

/// Whether a distance may be fed to the solver
pub fn is_usable_distance(d: f64) -> bool {
    d.is_finite() && d > 0.0
}
