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

//! The fixed-cadence control loop.
//!
//! Each iteration reads the sensor when due, then either advances a pending
//! autotune session or computes the PID output, and finally drives the relay
//! window. Requests from outside are only serviced while regulating: an
//! autotune session occupies the device until it ends.

use embedded_hal::digital::OutputPin;
use log::{error, info, warn};

use crate::autotune::{AutotunePhase, Autotuner};
use crate::error::{Error, Result};
use crate::pid::PidController;
use crate::relay::RelayWindow;
use crate::requests::{Request, RequestSource, Status, TemperatureUpdate, TuningUpdate};
use crate::sensor::TemperatureSensor;
use crate::settings::Settings;
use crate::store::{ConfigRecord, ConfigStore, StorageRegion};
use crate::{ControlState, Mode, PidParameters, RelayState};

/// What the last iteration did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cycle {
    /// The autotuner owns the loop
    Tuning,
    /// Normal PID regulation
    Regulating,
}

pub struct Controller<S, P, R> {
    sensor: S,
    relay: RelayWindow<P>,
    store: ConfigStore<R>,
    pid: PidController,
    autotuner: Option<Autotuner>,
    state: ControlState,
    record: ConfigRecord,
    default_tunings: PidParameters,
    sensor_interval_ms: u64,
    last_read: Option<u64>,
}

impl<S, P, R> Controller<S, P, R>
where
    S: TemperatureSensor,
    P: OutputPin,
    R: StorageRegion,
{
    /// Load the persisted record and get ready for the first iteration.
    ///
    /// An uninitialized store gets the default record. With autotuning
    /// enabled the gains are left to an autotune session, which persists the
    /// record once it finishes; otherwise defaults are saved right away.
    pub fn boot(
        settings: &Settings,
        sensor: S,
        pin: P,
        region: R,
        now_ms: u64,
    ) -> Result<Self> {
        let mut store = ConfigStore::new(region, settings.store.version_flag);
        let defaults = settings.default_record();

        let (record, autotuner) = match store.load()? {
            Some(record) => {
                info!(
                    "Loaded configuration: brew {:.1}°C, steam {:.1}°C, kp {:.3}, ki {:.3}, kd {:.3}",
                    record.brew_temp, record.steam_temp, record.kp, record.ki, record.kd
                );
                (record, None)
            }
            None if settings.autotune.enabled => {
                info!("Store uninitialized, scheduling autotune");
                let mut tuner = Autotuner::new(settings.autotune_config(defaults.brew_temp));
                tuner.start(now_ms);
                (defaults, Some(tuner))
            }
            None => {
                info!("Store uninitialized, writing defaults");
                store.save(&defaults)?;
                (defaults, None)
            }
        };

        let window = settings.window_size_ms.max(1);
        let mut relay = RelayWindow::new(pin, window, settings.max_boiler_temp);
        relay.start(now_ms)?;

        let pid = PidController::new(record.tunings(), settings.sample_time_ms)
            .with_output_limits(0.0, window as f64);

        let mut controller = Controller {
            sensor,
            relay,
            store,
            pid,
            autotuner,
            state: ControlState {
                input: 0.0,
                setpoint: record.brew_temp,
                output: 0.0,
                mode: Mode::Brew,
            },
            record,
            default_tunings: defaults.tunings(),
            sensor_interval_ms: settings.sensor_interval_ms,
            last_read: None,
        };
        controller.read_sensor(now_ms);
        controller.pid.initialize(&controller.state);
        Ok(controller)
    }

    /// Run one loop iteration and service pending requests if regulating.
    pub fn run_once<Q: RequestSource>(&mut self, now_ms: u64, requests: &mut Q) -> Result<Cycle> {
        let cycle = self.tick(now_ms)?;
        if cycle == Cycle::Regulating {
            while let Some(request) = requests.poll() {
                let reply = self.handle(request);
                requests.reply(&reply);
            }
        }
        Ok(cycle)
    }

    /// One control iteration without request handling.
    pub fn tick(&mut self, now_ms: u64) -> Result<Cycle> {
        self.read_sensor(now_ms);

        if let Some(tuner) = self.autotuner.as_mut() {
            match tuner.step(&mut self.state, now_ms) {
                AutotunePhase::Running | AutotunePhase::Idle => {
                    self.relay.actuate(&self.state, now_ms)?;
                }
                AutotunePhase::Finished(params) => {
                    self.relay.force_off()?;
                    self.autotuner = None;
                    info!(
                        "Autotune finished: kp {:.3}, ki {:.3}, kd {:.3}",
                        params.kp, params.ki, params.kd
                    );
                    self.apply_tunings(params);
                    self.store.set_retune_pending(false);
                    self.store.save(&self.record)?;
                    self.pid.initialize(&self.state);
                }
                AutotunePhase::Failed(reason) => {
                    self.relay.force_off()?;
                    self.autotuner = None;
                    error!(
                        "Autotune failed ({:?}), running on default gains until next boot",
                        reason
                    );
                    self.apply_tunings(self.default_tunings);
                    self.store.set_retune_pending(true);
                    self.pid.initialize(&self.state);
                }
            }
            return Ok(Cycle::Tuning);
        }

        self.pid.compute(&mut self.state, now_ms);
        self.relay.actuate(&self.state, now_ms)?;
        Ok(Cycle::Regulating)
    }

    fn read_sensor(&mut self, now_ms: u64) {
        if let Some(last) = self.last_read {
            if now_ms.saturating_sub(last) < self.sensor_interval_ms {
                return;
            }
        }
        self.last_read = Some(now_ms);
        match self.sensor.read_celsius() {
            Ok(temperature) => self.state.input = temperature,
            Err(e) => warn!("Temperature read failed: {:?}", e),
        }
    }

    fn apply_tunings(&mut self, params: PidParameters) {
        self.pid.set_tunings(params);
        self.record.set_tunings(params);
    }

    /// Dispatch a request and return the resulting status.
    pub fn handle(&mut self, request: Request) -> Result<Status> {
        if self.is_tuning() {
            return Err(Error::Busy);
        }
        match request {
            Request::Status => {}
            Request::SetTemperatures(update) => self.set_temperatures(update)?,
            Request::SetMode { mode } => self.set_mode(mode),
            Request::SetTunings(update) => self.set_tunings(update)?,
            Request::RequestAutotune => self.request_autotune()?,
        }
        Ok(self.status())
    }

    /// Update brew and/or steam temperature; absent values stay unchanged.
    pub fn set_temperatures(&mut self, update: TemperatureUpdate) -> Result<()> {
        let brew = update.brew.filter(|t| t.is_finite());
        let steam = update.steam.filter(|t| t.is_finite());
        if brew.is_none() && steam.is_none() {
            return Ok(());
        }
        if let Some(t) = brew {
            self.record.brew_temp = t;
        }
        if let Some(t) = steam {
            self.record.steam_temp = t;
        }
        self.state.setpoint = self.mode_setpoint(self.state.mode);
        self.store.save(&self.record)
    }

    /// Switch between brew and steam setpoints. Not persisted.
    pub fn set_mode(&mut self, mode: Mode) {
        if mode != self.state.mode {
            info!("Switching to {:?} mode", mode);
        }
        self.state.mode = mode;
        self.state.setpoint = self.mode_setpoint(mode);
    }

    /// Update any of the gains; absent or invalid values stay unchanged.
    pub fn set_tunings(&mut self, update: TuningUpdate) -> Result<()> {
        let valid = |g: Option<f64>| g.filter(|g| g.is_finite() && *g >= 0.0);
        let update = TuningUpdate {
            kp: valid(update.kp),
            ki: valid(update.ki),
            kd: valid(update.kd),
        };
        if update.is_empty() {
            return Ok(());
        }
        self.apply_tunings(update.apply_to(self.record.tunings()));
        self.store.save(&self.record)
    }

    /// Mark the store so the next boot runs an autotune session.
    pub fn request_autotune(&mut self) -> Result<()> {
        self.store.request_autotune()
    }

    fn mode_setpoint(&self, mode: Mode) -> f64 {
        match mode {
            Mode::Brew => self.record.brew_temp,
            Mode::Steam => self.record.steam_temp,
        }
    }

    pub fn status(&self) -> Status {
        Status {
            input: self.state.input,
            setpoint: self.state.setpoint,
            mode: self.state.mode,
            brew_temp: self.record.brew_temp,
            steam_temp: self.record.steam_temp,
            kp: self.record.kp,
            ki: self.record.ki,
            kd: self.record.kd,
            output: self.state.output,
            relay: self.relay.state(),
            tuning: self.is_tuning(),
        }
    }

    pub fn input(&self) -> f64 {
        self.state.input
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn brew_temp(&self) -> f64 {
        self.record.brew_temp
    }

    pub fn steam_temp(&self) -> f64 {
        self.record.steam_temp
    }

    pub fn tunings(&self) -> PidParameters {
        self.record.tunings()
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn is_tuning(&self) -> bool {
        self.autotuner.is_some()
    }

    pub fn autotuner(&self) -> Option<&Autotuner> {
        self.autotuner.as_ref()
    }

    pub fn store(&self) -> &ConfigStore<R> {
        &self.store
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedBoiler;
    use crate::store::{MemoryRegion, VERSION_FLAG};
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Sensor fed from a shared cell, counting reads.
    #[derive(Clone, Default)]
    struct ScriptedSensor {
        value: Rc<Cell<f64>>,
        reads: Rc<Cell<usize>>,
    }

    impl TemperatureSensor for ScriptedSensor {
        type Error = Infallible;

        fn read_celsius(&mut self) -> core::result::Result<f64, Infallible> {
            self.reads.set(self.reads.get() + 1);
            Ok(self.value.get())
        }
    }

    #[derive(Clone, Default)]
    struct SharedPin(Rc<Cell<bool>>);

    impl ErrorType for SharedPin {
        type Error = Infallible;
    }

    impl OutputPin for SharedPin {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            self.0.set(true);
            Ok(())
        }
    }

    struct Scripted {
        pending: Vec<Request>,
        replies: Vec<crate::Result<Status>>,
    }

    impl RequestSource for Scripted {
        fn poll(&mut self) -> Option<Request> {
            self.pending.pop()
        }

        fn reply(&mut self, status: &crate::Result<Status>) {
            self.replies.push(match status {
                Ok(s) => Ok(*s),
                Err(_) => Err(Error::Busy),
            });
        }
    }

    fn stored(record: &ConfigRecord) -> MemoryRegion {
        let mut store = ConfigStore::new(MemoryRegion::new(), VERSION_FLAG);
        store.save(record).unwrap();
        store.into_region()
    }

    fn record() -> ConfigRecord {
        ConfigRecord {
            brew_temp: 93.0,
            steam_temp: 140.0,
            kp: 400.0,
            ki: 5.0,
            kd: 0.0,
        }
    }

    fn boot_with(
        settings: &Settings,
        region: MemoryRegion,
        temperature: f64,
    ) -> (Controller<ScriptedSensor, SharedPin, MemoryRegion>, ScriptedSensor, SharedPin) {
        let sensor = ScriptedSensor::default();
        sensor.value.set(temperature);
        let pin = SharedPin::default();
        let controller =
            Controller::boot(settings, sensor.clone(), pin.clone(), region, 0).unwrap();
        (controller, sensor, pin)
    }

    #[test]
    fn test_boot_with_valid_store() {
        let (controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        assert!(!controller.is_tuning());
        assert_eq!(controller.brew_temp(), 93.0);
        assert_eq!(controller.state().setpoint, 93.0);
        assert_eq!(controller.tunings(), PidParameters::new(400.0, 5.0, 0.0));
        assert_eq!(controller.input(), 20.0);
    }

    #[test]
    fn test_boot_without_autotune_writes_defaults_once() {
        let mut settings = Settings::default();
        settings.autotune.enabled = false;
        let (controller, _, _) = boot_with(&settings, MemoryRegion::new(), 20.0);
        assert!(!controller.is_tuning());
        assert_eq!(controller.tunings(), PidParameters::new(2.4, 45.0, 10.0));

        // The store is valid now, a second boot loads it
        let region = controller.store().region().clone();
        let mut store = ConfigStore::new(region, VERSION_FLAG);
        assert_eq!(store.load().unwrap(), Some(settings.default_record()));
    }

    #[test]
    fn test_boot_with_autotune_defers_save() {
        let (controller, _, _) = boot_with(&Settings::default(), MemoryRegion::new(), 20.0);
        assert!(controller.is_tuning());
        assert_eq!(controller.store().region().image()[40], 0xFF);
    }

    #[test]
    fn test_sensor_read_rate_limit() {
        let (mut controller, sensor, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        assert_eq!(sensor.reads.get(), 1);

        sensor.value.set(30.0);
        controller.tick(100).unwrap();
        controller.tick(249).unwrap();
        assert_eq!(sensor.reads.get(), 1);
        assert_eq!(controller.input(), 20.0);

        controller.tick(250).unwrap();
        assert_eq!(sensor.reads.get(), 2);
        assert_eq!(controller.input(), 30.0);
    }

    #[test]
    fn test_regulation_drives_relay() {
        let (mut controller, _, pin) = boot_with(&Settings::default(), stored(&record()), 20.0);
        assert_eq!(controller.tick(10).unwrap(), Cycle::Regulating);
        // 73°C below setpoint with kp 400 saturates the window
        assert_eq!(controller.state().output, 5000.0);
        assert!(pin.0.get());
        assert_eq!(controller.relay_state(), RelayState::On);
    }

    #[test]
    fn test_over_temperature_forces_relay_off() {
        let mut settings = Settings::default();
        settings.max_boiler_temp = 170.0;
        let (mut controller, sensor, pin) = boot_with(&settings, stored(&record()), 20.0);
        controller.tick(10).unwrap();
        assert!(pin.0.get());

        sensor.value.set(200.0);
        controller.set_mode(Mode::Steam);
        controller.tick(300).unwrap();
        assert!(!pin.0.get());
        assert_eq!(controller.relay_state(), RelayState::Off);
    }

    #[test]
    fn test_mode_switching() {
        let (mut controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        controller.set_mode(Mode::Steam);
        assert_eq!(controller.state().setpoint, 140.0);
        controller.set_mode(Mode::Brew);
        assert_eq!(controller.state().setpoint, 93.0);
        assert_eq!(controller.brew_temp(), 93.0);
        assert_eq!(controller.steam_temp(), 140.0);
    }

    #[test]
    fn test_set_temperatures_partial() {
        let (mut controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        let before = *controller.store().region().image();

        // Nothing provided: nothing written
        controller
            .set_temperatures(TemperatureUpdate {
                brew: None,
                steam: None,
            })
            .unwrap();
        assert_eq!(*controller.store().region().image(), before);

        controller.set_mode(Mode::Steam);
        controller
            .set_temperatures(TemperatureUpdate {
                brew: None,
                steam: Some(145.0),
            })
            .unwrap();
        assert_eq!(controller.brew_temp(), 93.0);
        assert_eq!(controller.state().setpoint, 145.0);

        let region = controller.store().region().clone();
        let loaded = ConfigStore::new(region, VERSION_FLAG).load().unwrap().unwrap();
        assert_eq!(loaded.brew_temp, 93.0);
        assert_eq!(loaded.steam_temp, 145.0);
    }

    #[test]
    fn test_set_tunings_persists_and_ignores_invalid() {
        let (mut controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        controller
            .set_tunings(TuningUpdate {
                kp: Some(-5.0),
                ki: Some(7.5),
                kd: None,
            })
            .unwrap();
        assert_eq!(controller.tunings(), PidParameters::new(400.0, 7.5, 0.0));

        let region = controller.store().region().clone();
        let loaded = ConfigStore::new(region, VERSION_FLAG).load().unwrap().unwrap();
        assert_eq!(loaded.tunings(), PidParameters::new(400.0, 7.5, 0.0));
    }

    #[test]
    fn test_request_autotune_takes_effect_on_next_boot() {
        let (mut controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        let status = controller.handle(Request::RequestAutotune).unwrap();
        assert!(!status.tuning, "current session keeps regulating");

        let region = controller.store().region().clone();
        let (rebooted, _, _) = boot_with(&Settings::default(), region, 20.0);
        assert!(rebooted.is_tuning());
    }

    #[test]
    fn test_request_autotune_survives_later_saves() {
        let (mut controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        controller.handle(Request::RequestAutotune).unwrap();
        controller
            .handle(Request::SetTemperatures(TemperatureUpdate {
                brew: Some(94.0),
                steam: None,
            }))
            .unwrap();
        controller
            .handle(Request::SetTunings(TuningUpdate {
                kp: Some(350.0),
                ki: None,
                kd: None,
            }))
            .unwrap();
        assert_ne!(controller.store().region().image()[40], VERSION_FLAG);

        let region = controller.store().region().clone();
        let (rebooted, _, _) = boot_with(&Settings::default(), region, 20.0);
        assert!(rebooted.is_tuning());
    }

    #[test]
    fn test_interlock_active_while_tuning() {
        let mut settings = Settings::default();
        settings.max_boiler_temp = 170.0;
        let (mut controller, sensor, pin) = boot_with(&settings, MemoryRegion::new(), 20.0);
        assert!(controller.is_tuning());

        assert_eq!(controller.tick(10).unwrap(), Cycle::Tuning);
        assert!(pin.0.get(), "tuner heats first");

        sensor.value.set(200.0);
        assert_eq!(controller.tick(300).unwrap(), Cycle::Tuning);
        assert!(controller.is_tuning());
        assert!(!pin.0.get());
        assert_eq!(controller.relay_state(), RelayState::Off);
    }

    #[test]
    fn test_requests_are_not_serviced_while_tuning() {
        let (mut controller, _, _) = boot_with(&Settings::default(), MemoryRegion::new(), 20.0);
        let mut requests = Scripted {
            pending: vec![Request::Status],
            replies: Vec::new(),
        };
        assert_eq!(controller.run_once(10, &mut requests).unwrap(), Cycle::Tuning);
        assert_eq!(requests.pending.len(), 1);
        assert!(requests.replies.is_empty());
        assert!(matches!(controller.handle(Request::Status), Err(Error::Busy)));
    }

    #[test]
    fn test_requests_serviced_while_regulating() {
        let (mut controller, _, _) = boot_with(&Settings::default(), stored(&record()), 20.0);
        let mut requests = Scripted {
            pending: vec![Request::SetMode { mode: Mode::Steam }],
            replies: Vec::new(),
        };
        assert_eq!(controller.run_once(10, &mut requests).unwrap(), Cycle::Regulating);
        assert!(requests.pending.is_empty());
        let status = requests.replies[0].as_ref().unwrap();
        assert_eq!(status.mode, Mode::Steam);
        assert_eq!(status.setpoint, 140.0);
    }

    #[test]
    fn test_autotune_on_simulated_boiler() {
        let mut settings = Settings::default();
        settings.autotune.setpoint = Some(100.0);
        let boiler = SimulatedBoiler::espresso();
        let region = MemoryRegion::new();
        let mut controller =
            Controller::boot(&settings, boiler.sensor(), boiler.relay(), region, 0).unwrap();
        assert!(controller.is_tuning());

        let tick = 50;
        let mut now = 0;
        while controller.is_tuning() && now < 3_600_000 {
            now += tick;
            let cycle = controller.tick(now).unwrap();
            assert_eq!(cycle, Cycle::Tuning);
            if boiler.temperature() > settings.max_boiler_temp {
                assert!(!boiler.heater_on());
            }
            boiler.advance(tick);
        }

        assert!(!controller.is_tuning(), "autotune should converge");
        assert_eq!(controller.store().region().image()[40], VERSION_FLAG);
        let params = controller.tunings();
        assert!(params.is_valid(), "gains {:?}", params);
        assert!(params.kp > 0.0);
        assert_eq!(controller.relay_state(), RelayState::Off);
        assert!(!boiler.heater_on());

        let region = controller.store().region().clone();
        let loaded = ConfigStore::new(region, VERSION_FLAG).load().unwrap().unwrap();
        assert_eq!(loaded.tunings(), params);
        assert_eq!(loaded.brew_temp, 105.0);

        // Next iteration is back to normal regulation
        assert_eq!(controller.tick(now + tick).unwrap(), Cycle::Regulating);
    }

    #[test]
    fn test_autotune_timeout_falls_back_to_defaults() {
        let mut settings = Settings::default();
        settings.autotune.max_duration_s = Some(60);
        // The sensor never moves, so no oscillation can be observed
        let (mut controller, _, pin) = boot_with(&settings, MemoryRegion::new(), 20.0);

        let mut now = 0;
        while controller.is_tuning() && now < 120_000 {
            now += 100;
            controller.tick(now).unwrap();
        }
        assert!(!controller.is_tuning());
        assert!(now >= 60_000);
        assert_eq!(controller.tunings(), PidParameters::new(2.4, 45.0, 10.0));
        assert!(!pin.0.get());
        // Not marked valid, the next boot retries
        assert_eq!(controller.store().region().image()[40], 0xFF);

        // Even after a setter saves the record
        controller
            .set_temperatures(TemperatureUpdate {
                brew: Some(94.0),
                steam: None,
            })
            .unwrap();
        assert_ne!(controller.store().region().image()[40], VERSION_FLAG);
        let region = controller.store().region().clone();
        let (rebooted, _, _) = boot_with(&settings, region, 20.0);
        assert!(rebooted.is_tuning());
    }
}
