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

use crate::{ControlState, PidParameters};

/// PID controller for boiler temperature regulation
///
/// Runs on a fixed sample period: calls arriving before the period has
/// elapsed leave the output untouched. The derivative acts on the measurement
/// so setpoint changes (brew/steam toggles) do not kick the output, and the
/// integral term is clamped to the output range.
pub struct PidController {
    kp: f64,                // Proportional gain
    ki: f64,                // Integral gain, per second
    kd: f64,                // Derivative gain, in seconds
    sample_time_ms: u64,    // Minimum time between two computations
    integral: f64,          // Accumulated integral contribution
    last_input: f64,        // Previous measurement for derivative calculation
    last_time: Option<u64>, // Timestamp of the last computation
    pub output_min: f64,    // Minimum output value
    pub output_max: f64,    // Maximum output value
}

impl PidController {
    /// Create a new PID controller with output limits `[0, 1]`
    pub fn new(params: PidParameters, sample_time_ms: u64) -> Self {
        PidController {
            kp: params.kp,
            ki: params.ki,
            kd: params.kd,
            sample_time_ms: sample_time_ms.max(1),
            integral: 0.0,
            last_input: 0.0,
            last_time: None,
            output_min: 0.0,
            output_max: 1.0,
        }
    }

    /// Builder: set output limits.
    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        self.set_output_limits(min, max);
        self
    }

    /// Set output limits, ignoring an empty range
    pub fn set_output_limits(&mut self, min: f64, max: f64) {
        if min < max {
            self.output_min = min;
            self.output_max = max;
            self.integral = self.integral.clamp(min, max);
        }
    }

    /// Update PID parameters.
    ///
    /// Accumulated state is kept, so the new gains apply from the next
    /// computation onwards. Negative or non-finite gains are ignored.
    pub fn set_tunings(&mut self, params: PidParameters) {
        if !params.is_valid() {
            return;
        }
        self.kp = params.kp;
        self.ki = params.ki;
        self.kd = params.kd;
    }

    pub fn tunings(&self) -> PidParameters {
        PidParameters::new(self.kp, self.ki, self.kd)
    }

    pub fn sample_time_ms(&self) -> u64 {
        self.sample_time_ms
    }

    /// Seed the controller from the current state for a bumpless start.
    pub fn initialize(&mut self, state: &ControlState) {
        self.integral = state.output.clamp(self.output_min, self.output_max);
        self.last_input = state.input;
        self.last_time = None;
    }

    /// Calculate the control output from the current state.
    ///
    /// Writes `state.output` and returns `true` when a new value was computed,
    /// `false` when the sample period has not elapsed yet.
    pub fn compute(&mut self, state: &mut ControlState, now_ms: u64) -> bool {
        if let Some(last) = self.last_time {
            if now_ms.saturating_sub(last) < self.sample_time_ms {
                return false;
            }
        } else {
            // First computation after start: no previous measurement
            self.last_input = state.input;
        }

        let dt = self.sample_time_ms as f64 / 1000.0;
        let error = state.setpoint - state.input;

        // Integral term with anti-windup
        self.integral += self.ki * error * dt;
        self.integral = self.integral.clamp(self.output_min, self.output_max);

        // Derivative on measurement
        let d_input = (state.input - self.last_input) / dt;

        let output = self.kp * error + self.integral - self.kd * d_input;
        state.output = output.clamp(self.output_min, self.output_max);

        self.last_input = state.input;
        self.last_time = Some(now_ms);
        true
    }
}
