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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::autotune::AutotuneConfig;
use crate::error::Result;
use crate::store::{ConfigRecord, VERSION_FLAG};

/// Deployment settings, read from a YAML file.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub window_size_ms: u64,
    pub max_boiler_temp: f64,
    pub sensor_interval_ms: u64,
    pub sample_time_ms: u64,
    pub defaults: DefaultsConfig,
    pub store: StoreConfig,
    pub autotune: AutotuneSettings,
    pub hardware: HardwareConfig,
}

/// Values written when the store has to be initialized
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub brew_temp: f64,
    pub steam_temp: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub version_flag: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AutotuneSettings {
    pub enabled: bool,
    pub setpoint: Option<f64>,
    pub output_low: Option<f64>,
    pub output_high: Option<f64>,
    pub noise_band: f64,
    pub cycles: usize,
    pub sample_interval_ms: u64,
    pub max_duration_s: Option<u64>,
}

/// Raspberry Pi wiring and NTC thermistor parameters
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    pub relay_gpio: u8,
    pub i2c_device: String,
    pub ntc_r25: f64,
    pub ntc_beta: f64,
    pub ntc_series_resistor: f64,
    pub ref_voltage: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            window_size_ms: 5000,
            max_boiler_temp: 250.0,
            sensor_interval_ms: 250,
            sample_time_ms: 100,
            defaults: DefaultsConfig::default(),
            store: StoreConfig::default(),
            autotune: AutotuneSettings::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            brew_temp: 105.0,
            steam_temp: 170.0,
            kp: 2.4,
            ki: 45.0,
            kd: 10.0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from("boiler.eeprom"),
            version_flag: VERSION_FLAG,
        }
    }
}

impl Default for AutotuneSettings {
    fn default() -> Self {
        AutotuneSettings {
            enabled: true,
            setpoint: None,
            output_low: None,
            output_high: None,
            noise_band: 0.5,
            cycles: 4,
            sample_interval_ms: 1000,
            max_duration_s: Some(1800),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            relay_gpio: 16,
            i2c_device: "/dev/i2c-1".to_string(),
            ntc_r25: 100_000.0,
            ntc_beta: 3950.0,
            ntc_series_resistor: 4_700.0,
            ref_voltage: 4.096,
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Settings> {
        let input_file = std::fs::File::open(path)?;
        let settings: Settings = serde_yaml::from_reader(input_file)?;
        Ok(settings)
    }

    pub fn from_yaml(text: &str) -> Result<Settings> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Record written to an uninitialized store.
    pub fn default_record(&self) -> ConfigRecord {
        ConfigRecord {
            brew_temp: self.defaults.brew_temp,
            steam_temp: self.defaults.steam_temp,
            kp: self.defaults.kp,
            ki: self.defaults.ki,
            kd: self.defaults.kd,
        }
    }

    /// Autotune session parameters for a boiler currently set to `brew_temp`.
    pub fn autotune_config(&self, brew_temp: f64) -> AutotuneConfig {
        AutotuneConfig {
            setpoint: self.autotune.setpoint.unwrap_or(brew_temp),
            output_low: self.autotune.output_low.unwrap_or(0.0),
            output_high: self.autotune.output_high.unwrap_or(self.window_size_ms as f64),
            noise_band: self.autotune.noise_band,
            cycles: self.autotune.cycles,
            sample_interval_ms: self.autotune.sample_interval_ms,
            max_duration_ms: self.autotune.max_duration_s.map(|s| s.saturating_mul(1000)),
        }
    }
}
