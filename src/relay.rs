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

//! Time-proportioning relay output.
//!
//! The heater relay is binary, so the continuous controller output is spread
//! over a repeating window: the relay is energized for the leading part of the
//! window proportional to the output and released for the rest.
//!
//! Example
//! ```ignore
//! let mut relay = RelayWindow::new(pin, 5000, 250.0);
//! relay.start(now_ms);
//! let state = relay.actuate(&control_state, now_ms)?;
//! ```

use embedded_hal::digital::{Error as _, OutputPin};
use log::{error, info};

use crate::error::{Error, Result};
use crate::{ControlState, RelayState};

pub struct RelayWindow<P> {
    pin: P,
    window_size_ms: u64,  // Length of one on/off window
    window_start: u64,    // Start of the current window
    output_span: f64,     // Output value that means "on for the whole window"
    max_boiler_temp: f64, // Safety cutoff
    state: RelayState,
    interlocked: bool,
}

impl<P: OutputPin> RelayWindow<P> {
    /// Create a relay window whose output span equals the window size in ms.
    pub fn new(pin: P, window_size_ms: u64, max_boiler_temp: f64) -> Self {
        let window_size_ms = window_size_ms.max(1);
        RelayWindow {
            pin,
            window_size_ms,
            window_start: 0,
            output_span: window_size_ms as f64,
            max_boiler_temp,
            state: RelayState::Off,
            interlocked: false,
        }
    }

    /// Builder: interpret outputs as a fraction of `span` instead of milliseconds.
    pub fn with_output_span(mut self, span: f64) -> Self {
        if span > 0.0 {
            self.output_span = span;
        }
        self
    }

    /// Open the first window at `now_ms` with the relay released.
    pub fn start(&mut self, now_ms: u64) -> Result<()> {
        self.window_start = now_ms;
        self.write(RelayState::Off)
    }

    /// Drive the relay from the current control state.
    ///
    /// An over-temperature (or non-finite) reading forces the relay off and
    /// skips window evaluation altogether.
    pub fn actuate(&mut self, state: &ControlState, now_ms: u64) -> Result<RelayState> {
        if self.over_temperature(state.input) {
            if !self.interlocked {
                error!(
                    "Boiler at {:.1}°C exceeds {:.1}°C, heater forced off",
                    state.input, self.max_boiler_temp
                );
                self.interlocked = true;
            }
            self.write(RelayState::Off)?;
            return Ok(RelayState::Off);
        }
        if self.interlocked {
            info!("Boiler back at {:.1}°C, heater released", state.input);
            self.interlocked = false;
        }

        // Shift the window by whole periods to keep its phase
        while now_ms.saturating_sub(self.window_start) > self.window_size_ms {
            self.window_start += self.window_size_ms;
        }

        let elapsed = now_ms.saturating_sub(self.window_start) as f64;
        let target = if self.on_duration(state.output) > elapsed {
            RelayState::On
        } else {
            RelayState::Off
        };
        self.write(target)?;
        Ok(target)
    }

    /// Release the relay immediately, independent of the window.
    pub fn force_off(&mut self) -> Result<()> {
        self.write(RelayState::Off)
    }

    /// Length in ms of the ON part of a window for the given output.
    pub fn on_duration(&self, output: f64) -> f64 {
        let fraction = (output / self.output_span).clamp(0.0, 1.0);
        fraction * self.window_size_ms as f64
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    pub fn window_size_ms(&self) -> u64 {
        self.window_size_ms
    }

    pub fn output_span(&self) -> f64 {
        self.output_span
    }

    pub fn is_interlocked(&self) -> bool {
        self.interlocked
    }

    fn over_temperature(&self, input: f64) -> bool {
        !input.is_finite() || input > self.max_boiler_temp
    }

    fn write(&mut self, target: RelayState) -> Result<()> {
        match target {
            RelayState::On => self.pin.set_high(),
            RelayState::Off => self.pin.set_low(),
        }
        .map_err(|e| Error::Relay(e.kind()))?;
        self.state = target;
        Ok(())
    }
}
