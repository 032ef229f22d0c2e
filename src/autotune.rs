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

use core::f64::consts::PI;

use log::{debug, error, info};

use crate::{ControlState, PidParameters};

/// Autotuning parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AutotuneConfig {
    pub setpoint: f64,                // Temperature to oscillate around
    pub output_low: f64,              // Output while above the setpoint
    pub output_high: f64,             // Output while below the setpoint
    pub noise_band: f64,              // Hysteresis around the setpoint (°C)
    pub cycles: usize,                // Oscillations to measure
    pub sample_interval_ms: u64,      // Time between two samples
    pub max_duration_ms: Option<u64>, // Give up after this long
}

/// Lifecycle of one autotune session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutotunePhase {
    Idle,
    Running,
    Finished(PidParameters),
    Failed(AutotuneError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutotuneError {
    /// No convergence within the configured duration
    Timeout,
    /// Measured amplitude or period was not positive
    NoOscillation,
}

/// Autotuner for PID parameters using relay feedback method (Åström-Hägglund)
///
/// The output toggles between `output_high` and `output_low` whenever the
/// temperature leaves the noise band around the setpoint. Peaks are the
/// maxima seen while the output is low, valleys the minima while it is high.
/// Ultimate gain and period derived from them feed the Ziegler-Nichols rules.
pub struct Autotuner {
    config: AutotuneConfig,
    phase: AutotunePhase,
    heating: bool,                   // Current relay direction
    started_at: u64,                 // Session start
    last_sample: Option<u64>,        // Time of the last processed sample
    extreme: Option<(u64, f64)>,     // Running max/min of the current half cycle
    peaks: Vec<(u64, f64)>,          // (time, temperature) at peaks
    valleys: Vec<(u64, f64)>,        // (time, temperature) at valleys
}

impl Autotuner {
    pub fn new(mut config: AutotuneConfig) -> Self {
        // Need at least two periods after discarding the first peak
        config.cycles = config.cycles.max(2);
        if config.output_high < config.output_low {
            core::mem::swap(&mut config.output_high, &mut config.output_low);
        }
        Autotuner {
            config,
            phase: AutotunePhase::Idle,
            heating: true,
            started_at: 0,
            last_sample: None,
            extreme: None,
            peaks: Vec::new(),
            valleys: Vec::new(),
        }
    }

    /// Start a session, heating first.
    pub fn start(&mut self, now_ms: u64) {
        info!(
            "Autotuning around {:.1}°C, output {}..{}, noise band {}°C",
            self.config.setpoint, self.config.output_low, self.config.output_high, self.config.noise_band
        );
        self.phase = AutotunePhase::Running;
        self.heating = true;
        self.started_at = now_ms;
        self.last_sample = None;
        self.extreme = None;
        self.peaks.clear();
        self.valleys.clear();
    }

    /// Advance the session by one orchestrator iteration.
    ///
    /// While running, `state.output` is set to the relay level to actuate.
    /// Samples are only processed once per sample interval.
    pub fn step(&mut self, state: &mut ControlState, now_ms: u64) -> AutotunePhase {
        if self.phase != AutotunePhase::Running {
            return self.phase;
        }

        if let Some(max) = self.config.max_duration_ms {
            if now_ms.saturating_sub(self.started_at) >= max {
                error!("Autotuning did not converge within {} s", max / 1000);
                return self.fail(state, AutotuneError::Timeout);
            }
        }

        let due = self
            .last_sample
            .map_or(true, |t| now_ms.saturating_sub(t) >= self.config.sample_interval_ms);
        if due {
            self.last_sample = Some(now_ms);
            self.sample(state.input, now_ms);

            if self.peaks.len() > self.config.cycles && self.valleys.len() >= self.config.cycles {
                self.phase = match self.compute_parameters() {
                    Some(params) => AutotunePhase::Finished(params),
                    None => {
                        error!("Autotuning saw no usable oscillation");
                        return self.fail(state, AutotuneError::NoOscillation);
                    }
                };
                state.output = 0.0;
                return self.phase;
            }
        }

        state.output = self.output();
        self.phase
    }

    fn sample(&mut self, temperature: f64, now_ms: u64) {
        if !temperature.is_finite() {
            return;
        }

        // Track the extreme of the current half cycle
        self.extreme = match self.extreme {
            Some((_, t)) if self.heating && temperature >= t => self.extreme,
            Some((_, t)) if !self.heating && temperature <= t => self.extreme,
            _ => Some((now_ms, temperature)),
        };

        let error = self.config.setpoint - temperature;
        if self.heating && error < -self.config.noise_band {
            // Switch relay off, the heating half cycle ends on its valley
            if let Some(valley) = self.extreme.take() {
                if !self.peaks.is_empty() {
                    debug!("Valley at {} ms: {:.2}°C", valley.0 - self.started_at, valley.1);
                    self.valleys.push(valley);
                }
            }
            self.heating = false;
            self.extreme = Some((now_ms, temperature));
        } else if !self.heating && error > self.config.noise_band {
            // Switch relay on, the cooling half cycle ends on its peak
            if let Some(peak) = self.extreme.take() {
                debug!("Peak at {} ms: {:.2}°C", peak.0 - self.started_at, peak.1);
                self.peaks.push(peak);
            }
            self.heating = true;
            self.extreme = Some((now_ms, temperature));
        }
    }

    /// Calculate PID parameters from collected data
    fn compute_parameters(&self) -> Option<PidParameters> {
        // The first peak follows the warm-up from cold and is not representative
        let peaks = &self.peaks[1..];
        if peaks.len() < 2 || self.valleys.is_empty() {
            return None;
        }

        let peak_avg = peaks.iter().map(|p| p.1).sum::<f64>() / peaks.len() as f64;
        let valley_avg = self.valleys.iter().map(|v| v.1).sum::<f64>() / self.valleys.len() as f64;
        let amplitude = (peak_avg - valley_avg) / 2.0;

        let period_ms = peaks.windows(2).map(|w| (w[1].0 - w[0].0) as f64).sum::<f64>()
            / (peaks.len() - 1) as f64;
        let tu = period_ms / 1000.0;

        if !(amplitude > 0.0) || !(tu > 0.0) {
            return None;
        }

        // Calculate ultimate gain and period
        let relay_amplitude = (self.config.output_high - self.config.output_low) / 2.0;
        let ku = 4.0 * relay_amplitude / (PI * amplitude);

        info!(
            "Autotuning results: amplitude {:.2}°C, period {:.1}s, Ku {:.3}",
            amplitude, tu, ku
        );

        // Calculate PID parameters using Ziegler-Nichols method
        let params = PidParameters::new(0.6 * ku, 1.2 * ku / tu, 0.075 * ku * tu);
        params.is_valid().then_some(params)
    }

    fn fail(&mut self, state: &mut ControlState, reason: AutotuneError) -> AutotunePhase {
        state.output = 0.0;
        self.phase = AutotunePhase::Failed(reason);
        self.phase
    }

    /// Output level the relay should follow right now.
    pub fn output(&self) -> f64 {
        if self.heating {
            self.config.output_high
        } else {
            self.config.output_low
        }
    }

    pub fn phase(&self) -> AutotunePhase {
        self.phase
    }

    pub fn config(&self) -> &AutotuneConfig {
        &self.config
    }

    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    pub fn valley_count(&self) -> usize {
        self.valleys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;

    fn config() -> AutotuneConfig {
        AutotuneConfig {
            setpoint: 100.0,
            output_low: 0.0,
            output_high: 5000.0,
            noise_band: 0.5,
            cycles: 2,
            sample_interval_ms: 1000,
            max_duration_ms: None,
        }
    }

    fn state() -> ControlState {
        ControlState {
            input: 20.0,
            setpoint: 100.0,
            output: 0.0,
            mode: Mode::Brew,
        }
    }

    /// Feed a sequence of readings one second apart.
    fn feed(tuner: &mut Autotuner, s: &mut ControlState, readings: &[f64], start_ms: u64) -> AutotunePhase {
        let mut phase = tuner.phase();
        for (i, r) in readings.iter().enumerate() {
            s.input = *r;
            phase = tuner.step(s, start_ms + i as u64 * 1000);
        }
        phase
    }

    #[test]
    fn test_idle_until_started() {
        let mut tuner = Autotuner::new(config());
        let mut s = state();
        assert_eq!(tuner.step(&mut s, 0), AutotunePhase::Idle);
        tuner.start(0);
        assert_eq!(tuner.step(&mut s, 0), AutotunePhase::Running);
        assert_eq!(s.output, 5000.0);
    }

    #[test]
    fn test_relay_switches_outside_noise_band() {
        let mut tuner = Autotuner::new(config());
        let mut s = state();
        tuner.start(0);

        feed(&mut tuner, &mut s, &[90.0, 100.4], 0);
        assert_eq!(s.output, 5000.0, "inside the band, keep heating");
        feed(&mut tuner, &mut s, &[100.6], 2000);
        assert_eq!(s.output, 0.0);
        feed(&mut tuner, &mut s, &[99.6], 3000);
        assert_eq!(s.output, 0.0);
        feed(&mut tuner, &mut s, &[99.4], 4000);
        assert_eq!(s.output, 5000.0);
    }

    #[test]
    fn test_samples_are_rate_limited() {
        let mut tuner = Autotuner::new(config());
        let mut s = state();
        tuner.start(0);
        s.input = 50.0;
        tuner.step(&mut s, 0);
        s.input = 150.0;
        tuner.step(&mut s, 500);
        assert_eq!(s.output, 5000.0, "reading between samples is ignored");
        tuner.step(&mut s, 1000);
        assert_eq!(s.output, 0.0);
    }

    #[test]
    fn test_square_oscillation_gains() {
        let mut tuner = Autotuner::new(config());
        let mut s = state();
        tuner.start(0);

        // Warm-up, then a clean oscillation between 98 and 102 with a 4 s period
        let mut readings = vec![60.0, 80.0, 99.0];
        for _ in 0..4 {
            readings.extend_from_slice(&[101.0, 102.0, 99.0, 98.0]);
        }
        let phase = feed(&mut tuner, &mut s, &readings, 0);

        let params = match phase {
            AutotunePhase::Finished(p) => p,
            other => panic!("expected finished, got {:?}", other),
        };
        // a = 2°C, d = 2500 => Ku = 4 * 2500 / (2π), Tu = 4 s
        let ku = 4.0 * 2500.0 / (PI * 2.0);
        assert!((params.kp - 0.6 * ku).abs() < 1e-6);
        assert!((params.ki - 1.2 * ku / 4.0).abs() < 1e-6);
        assert!((params.kd - 0.075 * ku * 4.0).abs() < 1e-6);
        assert_eq!(s.output, 0.0);
        assert_eq!(tuner.step(&mut s, 1_000_000), phase, "finished is terminal");
    }

    #[test]
    fn test_timeout() {
        let mut cfg = config();
        cfg.max_duration_ms = Some(10_000);
        let mut tuner = Autotuner::new(cfg);
        let mut s = state();
        tuner.start(1000);

        assert_eq!(feed(&mut tuner, &mut s, &[20.0; 10], 1000), AutotunePhase::Running);
        s.input = 20.0;
        assert_eq!(
            tuner.step(&mut s, 11_000),
            AutotunePhase::Failed(AutotuneError::Timeout)
        );
        assert_eq!(s.output, 0.0);
    }

    #[test]
    fn test_cycles_have_a_floor() {
        let mut cfg = config();
        cfg.cycles = 0;
        assert_eq!(Autotuner::new(cfg).config().cycles, 2);
    }
}
