use crate::powers::Powers;
use std::fmt;


/// Outcome of the path-loss model for one transmitter–receiver pair.
///
/// `total_loss_db` is the received-to-transmitted power ratio in dB, so it is
/// negative for any attenuating path. Always check `valid` before reading it.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Results {
    pub powers: Powers,
    pub total_loss_db: f32,
    pub valid: bool,
}

impl Results {
    /// A result for a pair with no usable path.
    pub fn invalid() -> Self {
        Self {
            powers: Powers::new(),
            total_loss_db: f32::NEG_INFINITY,
            valid: false,
        }
    }

    pub fn from_powers(powers: Powers) -> Self {
        Self {
            powers,
            total_loss_db: powers.total_db(),
            valid: true,
        }
    }

    /// Attenuation as a positive number of decibels.
    pub fn path_loss_db(&self) -> f32 {
        -self.total_loss_db
    }
}

impl fmt::Display for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return writeln!(f, "Results: no usable path");
        }
        write!(f, "{}", self.powers)?;
        writeln!(f, "  Path Loss:   {:.2} dB", self.path_loss_db())
    }
}
