//! Received power split by propagation mechanism.
//!
//! All values are linear power ratios (received over transmitted), so the
//! contributions of independent paths can simply be summed before converting
//! the total back to decibels.

use std::{fmt, ops::*};

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn sum_of_mechanisms() {
        let powers = Powers {
            direct: 1e-6,
            reflected: 2e-7,
            diffracted: 3e-8,
        };
        assert!((powers.total() - 1.23e-6).abs() < 1e-10);
    }

    #[test]
    fn add_and_average() {
        let mut acc = Powers::new();
        acc += Powers {
            direct: 2.0,
            reflected: 4.0,
            diffracted: 0.0,
        };
        acc += Powers {
            direct: 4.0,
            reflected: 0.0,
            diffracted: 6.0,
        };
        acc /= 2.0;
        assert_eq!(
            acc,
            Powers {
                direct: 3.0,
                reflected: 2.0,
                diffracted: 3.0
            }
        );
    }

    #[test]
    fn total_in_decibels() {
        let powers = Powers {
            direct: 1e-6,
            ..Powers::new()
        };
        assert!((powers.total_db() + 60.0).abs() < 1e-4);
    }
}

/// Linear received power contributed by each mechanism.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Powers {
    pub direct: f32,     // line of sight
    pub reflected: f32,  // sum over specular reflections
    pub diffracted: f32, // knife-edge chain
}

impl DivAssign<f32> for Powers {
    fn div_assign(&mut self, rhs: f32) {
        self.direct /= rhs;
        self.reflected /= rhs;
        self.diffracted /= rhs;
    }
}

impl Add for Powers {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            direct: self.direct + other.direct,
            reflected: self.reflected + other.reflected,
            diffracted: self.diffracted + other.diffracted,
        }
    }
}

impl AddAssign for Powers {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Powers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combined linear power of every mechanism.
    pub fn total(&self) -> f32 {
        self.direct + self.reflected + self.diffracted
    }

    /// Combined power in dB. Negative infinity when nothing was received.
    pub fn total_db(&self) -> f32 {
        10.0 * self.total().log10()
    }
}

impl fmt::Display for Powers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Powers:")?;
        writeln!(f, "  Direct:      {:.6e}", self.direct)?;
        writeln!(f, "  Reflected:   {:.6e}", self.reflected)?;
        writeln!(f, "  Diffracted:  {:.6e}", self.diffracted)?;
        writeln!(f, "  Total:       {:.6e} ({:.2} dB)", self.total(), self.total_db())
    }
}
