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

//! What an outside client (web page, serial console, ...) may ask of the
//! controller, and the snapshot it gets back.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Mode, PidParameters, RelayState};

/// New brew/steam temperatures, each independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureUpdate {
    pub brew: Option<f64>,
    pub steam: Option<f64>,
}

/// New PID gains, each independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningUpdate {
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,
}

impl TuningUpdate {
    /// Merge into existing gains, keeping those not provided.
    pub fn apply_to(&self, current: PidParameters) -> PidParameters {
        PidParameters::new(
            self.kp.unwrap_or(current.kp),
            self.ki.unwrap_or(current.ki),
            self.kd.unwrap_or(current.kd),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.kp.is_none() && self.ki.is_none() && self.kd.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Status,
    SetTemperatures(TemperatureUpdate),
    SetMode { mode: Mode },
    SetTunings(TuningUpdate),
    RequestAutotune,
}

/// Snapshot returned for every request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub input: f64,
    pub setpoint: f64,
    pub mode: Mode,
    pub brew_temp: f64,
    pub steam_temp: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output: f64,
    pub relay: RelayState,
    pub tuning: bool,
}

/// Where the controller pulls requests from between control iterations.
pub trait RequestSource {
    fn poll(&mut self) -> Option<Request>;

    fn reply(&mut self, status: &crate::Result<Status>);
}

/// A request source that never has anything to say.
pub struct NoRequests;

impl RequestSource for NoRequests {
    fn poll(&mut self) -> Option<Request> {
        None
    }

    fn reply(&mut self, _status: &crate::Result<Status>) {}
}

/// Parse a form-style numeric field.
///
/// Empty, malformed and non-finite values mean "leave unchanged".
pub fn parse_field(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            warn!("Ignoring malformed value {:?}", raw);
            None
        }
    }
}

/// Like [`parse_field`], additionally rejecting negative gains.
pub fn parse_gain(raw: &str) -> Option<f64> {
    match parse_field(raw) {
        Some(v) if v < 0.0 => {
            warn!("Ignoring negative gain {}", v);
            None
        }
        other => other,
    }
}

/// Parse one console command line.
///
/// ```text
/// status
/// temps brew=93 steam=
/// mode steam            (or brew, 1, 0)
/// pid kp=600 ki=35 kd=
/// autotune
/// ```
pub fn parse_command(line: &str) -> Option<Request> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_ascii_lowercase();
    let args: Vec<(&str, &str)> = words
        .map(|w| w.split_once('=').unwrap_or((w, "")))
        .collect();
    let arg = |name: &str| {
        args.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    };

    match command.as_str() {
        "status" => Some(Request::Status),
        "temps" => Some(Request::SetTemperatures(TemperatureUpdate {
            brew: arg("brew").and_then(parse_field),
            steam: arg("steam").and_then(parse_field),
        })),
        "mode" => {
            let mode = match args.first().map(|(k, _)| k.to_ascii_lowercase()).as_deref() {
                Some("steam") | Some("1") => Mode::Steam,
                Some("brew") | Some("0") => Mode::Brew,
                _ => return None,
            };
            Some(Request::SetMode { mode })
        }
        "pid" => Some(Request::SetTunings(TuningUpdate {
            kp: arg("kp").and_then(parse_gain),
            ki: arg("ki").and_then(parse_gain),
            kd: arg("kd").and_then(parse_gain),
        })),
        "autotune" => Some(Request::RequestAutotune),
        _ => None,
    }
}
