//! Hardware seam of the module side bit transceiver.
//!
//! A module sees the bus through one input pin with an edge interrupt, one
//! output it can drive or release, and a periodic bit timer. Implementations
//! map these onto real registers or onto the simulator.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Mapping between logical bits and physical line levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
pub enum Polarity {
    /// Idle high, start bit low
    #[default]
    #[strum(to_string = "normal")]
    Normal,
    /// Idle low, start bit high
    #[strum(to_string = "inverted")]
    Inverted,
}

impl Polarity {
    /// Polarity implied by the level of an idle line
    pub fn from_idle_level(level: bool) -> Self {
        if level { Polarity::Normal } else { Polarity::Inverted }
    }

    /// Polarity implied by the level right after a start edge.
    /// The start bit is a logical 0.
    pub fn from_start_level(level: bool) -> Self {
        if level { Polarity::Inverted } else { Polarity::Normal }
    }

    pub fn toggled(self) -> Self {
        match self {
            Polarity::Normal => Polarity::Inverted,
            Polarity::Inverted => Polarity::Normal,
        }
    }

    /// Physical level to logical bit
    pub fn to_logical(self, level: bool) -> bool {
        match self {
            Polarity::Normal => level,
            Polarity::Inverted => !level,
        }
    }

    /// Logical bit to physical level. The mapping is its own inverse.
    pub fn to_physical(self, bit: bool) -> bool {
        self.to_logical(bit)
    }

    /// Physical level of an idle line
    pub fn idle_level(self) -> bool {
        self.to_physical(true)
    }
}

/// Pin and timer access for one module transceiver
pub trait LineDriver {
    /// Current physical level of the receive pin
    fn sample(&self) -> bool;

    /// Drive the transmit pin to a physical level
    fn drive(&mut self, level: bool);

    /// Stop driving; the line returns to its idle level
    fn release(&mut self);

    /// Start the periodic bit timer. The first tick arrives half a bit
    /// after the call, later ticks one bit apart.
    fn start_ticks(&mut self);

    fn stop_ticks(&mut self);

    /// Enable or disable the edge interrupt on the receive pin
    fn arm_edge(&mut self, armed: bool);
}
