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

//! Simulated boiler for host runs and closed-loop tests.

use core::convert::Infallible;
use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::digital::{ErrorType, OutputPin};

use crate::sensor::TemperatureSensor;

/// Thermal model for simulation
pub struct ThermalSystem {
    temperature: f64,          // Current boiler temperature (°C)
    sensed: f64,               // Temperature seen by the probe (°C)
    pub ambient_temp: f64,     // Ambient temperature (°C)
    pub thermal_capacity: f64, // Thermal capacity (J/°C)
    pub heater_power: f64,     // Heater power (W)
    pub heat_loss_coeff: f64,  // Heat loss coefficient (W/°C)
    pub sensor_lag_s: f64,     // Probe time constant (s)
}

impl ThermalSystem {
    pub fn new(
        initial_temp: f64,
        ambient_temp: f64,
        thermal_capacity: f64,
        heater_power: f64,
        heat_loss_coeff: f64,
    ) -> Self {
        ThermalSystem {
            temperature: initial_temp,
            sensed: initial_temp,
            ambient_temp,
            thermal_capacity,
            heater_power,
            heat_loss_coeff,
            sensor_lag_s: 0.0,
        }
    }

    /// Builder: first-order lag between the boiler and its probe.
    pub fn with_sensor_lag(mut self, lag_s: f64) -> Self {
        self.sensor_lag_s = lag_s.max(0.0);
        self
    }

    /// Update temperature based on heater duty cycle
    pub fn update(&mut self, duty_cycle: f64, dt: f64) {
        // Heat added by heating element (J)
        let heat_added = self.heater_power * duty_cycle * dt;

        // Heat lost to environment (J)
        let heat_lost = self.heat_loss_coeff * (self.temperature - self.ambient_temp) * dt;

        // Net heat and temperature change
        let net_heat = heat_added - heat_lost;
        self.temperature += net_heat / self.thermal_capacity;

        // Probe follows the boiler
        if self.sensor_lag_s > 0.0 {
            let alpha = (dt / self.sensor_lag_s).min(1.0);
            self.sensed += (self.temperature - self.sensed) * alpha;
        } else {
            self.sensed = self.temperature;
        }
    }

    pub fn get_temperature(&self) -> f64 {
        self.temperature
    }

    pub fn sensed_temperature(&self) -> f64 {
        self.sensed
    }
}

struct Shared {
    system: ThermalSystem,
    heater_on: bool,
}

/// A boiler with a relay-switched heater, shared between the simulated
/// sensor and relay handles.
#[derive(Clone)]
pub struct SimulatedBoiler {
    inner: Rc<RefCell<Shared>>,
}

impl SimulatedBoiler {
    pub fn new(system: ThermalSystem) -> Self {
        SimulatedBoiler {
            inner: Rc::new(RefCell::new(Shared {
                system,
                heater_on: false,
            })),
        }
    }

    /// Small single-boiler espresso machine starting cold:
    /// 1000 W element, 600 J/°C, 1 W/°C losses, 3 s probe lag.
    pub fn espresso() -> Self {
        Self::new(ThermalSystem::new(22.0, 22.0, 600.0, 1000.0, 1.0).with_sensor_lag(3.0))
    }

    pub fn sensor(&self) -> SimulatedSensor {
        SimulatedSensor {
            boiler: self.clone(),
        }
    }

    pub fn relay(&self) -> SimulatedRelay {
        SimulatedRelay {
            boiler: self.clone(),
        }
    }

    /// Let `dt_ms` pass with the heater in its current state.
    pub fn advance(&self, dt_ms: u64) {
        let mut shared = self.inner.borrow_mut();
        let duty = if shared.heater_on { 1.0 } else { 0.0 };
        shared.system.update(duty, dt_ms as f64 / 1000.0);
    }

    pub fn temperature(&self) -> f64 {
        self.inner.borrow().system.get_temperature()
    }

    pub fn sensed_temperature(&self) -> f64 {
        self.inner.borrow().system.sensed_temperature()
    }

    pub fn heater_on(&self) -> bool {
        self.inner.borrow().heater_on
    }
}

pub struct SimulatedSensor {
    boiler: SimulatedBoiler,
}

impl TemperatureSensor for SimulatedSensor {
    type Error = Infallible;

    fn read_celsius(&mut self) -> Result<f64, Infallible> {
        Ok(self.boiler.sensed_temperature())
    }
}

pub struct SimulatedRelay {
    boiler: SimulatedBoiler,
}

impl ErrorType for SimulatedRelay {
    type Error = Infallible;
}

impl OutputPin for SimulatedRelay {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.boiler.inner.borrow_mut().heater_on = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.boiler.inner.borrow_mut().heater_on = true;
        Ok(())
    }
}
