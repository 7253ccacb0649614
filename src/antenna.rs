//! Transmitters, receivers and their directional gain patterns.

use anyhow::{anyhow, Result};
use nalgebra::{Point3, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;


/// Identifier of a transmitter within one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransmitterId(pub usize);

/// Identifier of a receiver within one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverId(pub usize);

impl fmt::Display for TransmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rx{}", self.0)
    }
}

/// Antenna gain in dBi tabulated over elevation and azimuth.
///
/// Row `i` holds elevation `-90 + i * 180 / (rows - 1)` degrees, column `j`
/// holds azimuth `j * 360 / cols` degrees. Azimuth is measured in the
/// horizontal x/z plane from +x toward +z, elevation from that plane toward +y.
#[derive(Debug, Clone, PartialEq)]
pub struct GainPattern {
    gains: Array2<f32>,
}

impl GainPattern {
    pub fn new(gains: Array2<f32>) -> Result<Self> {
        let (rows, cols) = gains.dim();
        if rows < 2 {
            return Err(anyhow!(
                "gain pattern needs at least 2 elevation rows, got {}",
                rows
            ));
        }
        if cols == 0 {
            return Err(anyhow!("gain pattern needs at least 1 azimuth column"));
        }
        Ok(Self { gains })
    }

    /// Tabulates `gain(elevation_deg, azimuth_deg)` on a `rows` x `cols` grid.
    /// `rows` must be at least 2 and `cols` at least 1.
    pub fn from_fn(rows: usize, cols: usize, gain: impl Fn(f32, f32) -> f32) -> Self {
        let elevation_step = 180.0 / (rows.max(2) - 1) as f32;
        let azimuth_step = 360.0 / cols.max(1) as f32;
        let gains = Array2::from_shape_fn((rows.max(2), cols.max(1)), |(i, j)| {
            gain(-90.0 + i as f32 * elevation_step, j as f32 * azimuth_step)
        });
        Self { gains }
    }

    /// 0 dBi in every direction.
    pub fn isotropic() -> Self {
        Self {
            gains: Array2::zeros((2, 1)),
        }
    }

    /// Gain in dBi toward `direction`, taken from the nearest tabulated bin.
    pub fn gain_dbi(&self, direction: &Vector3<f32>) -> f32 {
        let (rows, cols) = self.gains.dim();
        let horizontal = direction.x.hypot(direction.z);
        let elevation = direction.y.atan2(horizontal).to_degrees();
        let azimuth = direction.z.atan2(direction.x).to_degrees().rem_euclid(360.0);

        let elevation_step = 180.0 / (rows - 1) as f32;
        let azimuth_step = 360.0 / cols as f32;

        let row = (((elevation + 90.0) / elevation_step).round() as usize).min(rows - 1);
        let col = (azimuth / azimuth_step).round() as usize % cols;
        self.gains[[row, col]]
    }

    /// Linear power gain toward `direction`.
    pub fn linear_gain(&self, direction: &Vector3<f32>) -> f32 {
        10.0_f32.powf(self.gain_dbi(direction) / 10.0)
    }
}

/// A radio transmitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmitter {
    pub id: TransmitterId,
    pub position: Point3<f32>,
    /// Carrier frequency in Hz.
    pub frequency: f32,
    pub pattern: Option<GainPattern>,
}

impl Transmitter {
    pub fn new(id: TransmitterId, position: Point3<f32>, frequency: f32) -> Self {
        Self {
            id,
            position,
            frequency,
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: GainPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Linear gain toward a point, 1 when no pattern is assigned.
    pub fn gain_towards(&self, target: &Point3<f32>) -> f32 {
        linear_gain(self.pattern.as_ref(), &(target - self.position))
    }
}

/// A radio receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Receiver {
    pub id: ReceiverId,
    pub position: Point3<f32>,
    pub pattern: Option<GainPattern>,
}

impl Receiver {
    pub fn new(id: ReceiverId, position: Point3<f32>) -> Self {
        Self {
            id,
            position,
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: GainPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Linear gain toward a point, 1 when no pattern is assigned.
    pub fn gain_towards(&self, target: &Point3<f32>) -> f32 {
        linear_gain(self.pattern.as_ref(), &(target - self.position))
    }
}

pub(crate) fn linear_gain(pattern: Option<&GainPattern>, direction: &Vector3<f32>) -> f32 {
    pattern.map_or(1.0, |p| p.linear_gain(direction))
}
