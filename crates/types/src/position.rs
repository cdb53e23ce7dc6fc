//! Display position carried alongside participants.

use serde::{Deserialize, Serialize};

/// 2D display position.
///
/// Presentation metadata only: protocol models store and copy it, but never
/// compute or read it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Create a position.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Evenly spaced point `index` of `count` on a circle of the given radius
    /// centred on the origin, starting at the top.
    pub fn on_ring(index: usize, count: usize, radius: f64) -> Self {
        if count == 0 {
            return Self::default();
        }
        let angle = std::f64::consts::TAU * index as f64 / count as f64
            - std::f64::consts::FRAC_PI_2;
        Self::new(radius * angle.cos(), radius * angle.sin())
    }
}
