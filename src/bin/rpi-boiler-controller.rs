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

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use ads1x1x::{channel, Ads1x1x, FullScaleRange, TargetAddr};
use anyhow::{anyhow, Context};
use boiler_controller::requests::parse_command;
use boiler_controller::settings::HardwareConfig;
use boiler_controller::{
    Clock, Controller, FileRegion, MonotonicClock, Request, RequestSource, Settings, Status,
    TemperatureSensor,
};
use clap::Parser;
use env_logger::Env;
use linux_embedded_hal::I2cdev;
use log::{info, warn};
use nb::block;
use rppal::gpio::Gpio;

const ABS_ZERO: f64 = 273.15; // Absolute zero in Celsius
const T25_KELVIN: f64 = 25.0 + ABS_ZERO; // 25°C in Kelvin

// Cooperative yield between loop iterations
const LOOP_YIELD_MS: u64 = 5;

type Adc = Ads1x1x<I2cdev, ads1x1x::ic::Ads1115, ads1x1x::ic::Resolution16Bit, ads1x1x::mode::OneShot>;

/// Run the boiler controller on a Raspberry Pi.
#[derive(Parser, Debug)]
#[command(name = "rpi-boiler-controller", version)]
struct Args {
    /// YAML settings file (defaults apply when it does not exist)
    #[arg(default_value = "boiler.yaml")]
    settings: PathBuf,
}

/// NTC thermistor read through an ADS1115 ADC
struct NtcSensor {
    adc: Adc,
    hw: HardwareConfig,
}

#[derive(Debug)]
enum NtcError {
    Adc(String),
    InvalidVoltage(f64),
}

impl NtcSensor {
    fn new(hw: HardwareConfig) -> anyhow::Result<Self> {
        let i2c_dev = I2cdev::new(&hw.i2c_device)
            .with_context(|| format!("opening {}", hw.i2c_device))?;
        let mut adc = Ads1x1x::new_ads1115(i2c_dev, TargetAddr::default());
        adc.set_full_scale_range(FullScaleRange::Within4_096V)
            .map_err(|e| anyhow!("configuring ADS1115: {:?}", e))?;
        Ok(NtcSensor { adc, hw })
    }
}

impl TemperatureSensor for NtcSensor {
    type Error = NtcError;

    /// Read temperature from NTC thermistor via ADS1115 ADC
    fn read_celsius(&mut self) -> Result<f64, NtcError> {
        // Read raw ADC value
        let raw_value =
            block!(self.adc.read(channel::SingleA0)).map_err(|e| NtcError::Adc(format!("{:?}", e)))?;

        // Convert raw value to voltage (ADS1115 is 16-bit signed, -32768 to +32767)
        let voltage = (raw_value as f64 / 32768.0) * self.hw.ref_voltage;

        // NTC between ADC input and GND, series resistor between ADC input and VREF
        if voltage <= 0.0 || voltage >= self.hw.ref_voltage {
            return Err(NtcError::InvalidVoltage(voltage));
        }
        let ntc_resistance = self.hw.ntc_series_resistor * voltage / (self.hw.ref_voltage - voltage);

        // Simplified Steinhart-Hart equation: 1/T = 1/T0 + (1/B) * ln(R/R0)
        let temp_kelvin =
            1.0 / (1.0 / T25_KELVIN + (1.0 / self.hw.ntc_beta) * (ntc_resistance / self.hw.ntc_r25).ln());
        Ok(temp_kelvin - ABS_ZERO)
    }
}

/// Console commands typed on stdin, answered with a JSON status line.
struct ConsoleRequests {
    lines: Receiver<String>,
}

impl ConsoleRequests {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        ConsoleRequests { lines: rx }
    }
}

impl RequestSource for ConsoleRequests {
    fn poll(&mut self) -> Option<Request> {
        loop {
            match self.lines.try_recv() {
                Ok(line) => match parse_command(&line) {
                    Some(request) => return Some(request),
                    None if line.trim().is_empty() => continue,
                    None => warn!("Unknown command {:?}", line.trim()),
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn reply(&mut self, status: &boiler_controller::Result<Status>) {
        match status {
            Ok(status) => match serde_json::to_string(status) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Cannot encode status: {}", e),
            },
            Err(e) => println!("{{\"error\":\"{}\"}}", e),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().filter_or("BOILER_LOG", "info"));
    let args = Args::parse();

    let settings = if args.settings.exists() {
        Settings::from_file(&args.settings)
            .with_context(|| format!("reading settings from {}", args.settings.display()))?
    } else {
        warn!("{} not found, using default settings", args.settings.display());
        Settings::default()
    };

    info!("Raspberry Pi boiler controller");
    info!(
        "Window {} ms, safety cutoff {:.0}°C, relay on GPIO{}",
        settings.window_size_ms, settings.max_boiler_temp, settings.hardware.relay_gpio
    );

    let sensor = NtcSensor::new(settings.hardware.clone())?;
    let relay_pin = Gpio::new()?
        .get(settings.hardware.relay_gpio)?
        .into_output_low();
    let region = FileRegion::new(&settings.store.path);

    let clock = MonotonicClock::new();
    let mut controller = Controller::boot(&settings, sensor, relay_pin, region, clock.now_ms())?;
    let mut requests = ConsoleRequests::spawn();

    if controller.is_tuning() {
        info!("Autotuning, console commands are queued until it completes");
    }

    // Main control loop
    loop {
        controller.run_once(clock.now_ms(), &mut requests)?;

        // Small sleep to prevent CPU hogging
        thread::sleep(Duration::from_millis(LOOP_YIELD_MS));
    }
}
