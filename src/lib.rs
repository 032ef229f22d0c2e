// MIT License
//
// Copyright (c) 2025 Ronan LE MEILLAT for SCTG Development
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Self-tuning boiler temperature controller.
//!
//! A PID loop drives a single heater relay through a time-proportioning
//! window, a relay-feedback autotuner finds the gains on first boot, and a
//! small versioned record keeps setpoints and gains across power cycles.

use serde::{Deserialize, Serialize};

pub mod autotune;
pub mod controller;
pub mod error;
pub mod pid;
pub mod relay;
pub mod requests;
pub mod sensor;
pub mod settings;
pub mod simulation;
pub mod store;

pub use autotune::{AutotuneConfig, AutotuneError, AutotunePhase, Autotuner};
pub use controller::{Controller, Cycle};
pub use error::{Error, Result};
pub use pid::PidController;
pub use relay::RelayWindow;
pub use requests::{Request, RequestSource, Status, TemperatureUpdate, TuningUpdate};
pub use sensor::{Clock, MonotonicClock, TemperatureSensor};
pub use settings::Settings;
pub use store::{ConfigRecord, ConfigStore, FileRegion, MemoryRegion, StorageRegion};

/// Which of the two stored temperatures the boiler regulates to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Brew,
    Steam,
}

/// PID gains
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParameters {
    pub kp: f64, // Proportional gain
    pub ki: f64, // Integral gain
    pub kd: f64, // Derivative gain
}

impl PidParameters {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        PidParameters { kp, ki, kd }
    }

    /// All gains finite and non-negative.
    pub fn is_valid(&self) -> bool {
        [self.kp, self.ki, self.kd]
            .iter()
            .all(|g| g.is_finite() && *g >= 0.0)
    }
}

/// Heater relay line level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

/// Live control values, owned by the [`Controller`] and lent to the PID,
/// relay window and autotuner each iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlState {
    pub input: f64,    // Measured boiler temperature (°C)
    pub setpoint: f64, // Either the brew or the steam temperature
    pub output: f64,   // Controller output, in relay output units
    pub mode: Mode,
}
