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

use std::path::PathBuf;

use anyhow::Context;
use boiler_controller::requests::NoRequests;
use boiler_controller::simulation::SimulatedBoiler;
use boiler_controller::{ConfigStore, Controller, Cycle, MemoryRegion, Mode, Settings};
use clap::Parser;
use env_logger::Env;
use log::info;

/// Boot the boiler controller against a simulated espresso boiler.
#[derive(Parser, Debug)]
#[command(name = "boiler-simulation", version)]
struct Args {
    /// YAML settings file (defaults apply when omitted)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Simulated run time in seconds
    #[arg(short, long, default_value_t = 1200)]
    duration: u64,

    /// Loop period in milliseconds
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,

    /// Switch to steam mode after this many seconds
    #[arg(long)]
    steam_at: Option<u64>,

    /// Seconds between two printed rows
    #[arg(long, default_value_t = 5)]
    print_every: u64,

    /// Start from a stored record instead of an erased store (skips autotuning)
    #[arg(long)]
    preset: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().filter_or("BOILER_LOG", "info"));
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("reading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    let boiler = SimulatedBoiler::espresso();
    let region = if args.preset {
        preset_region(&settings)?
    } else {
        MemoryRegion::new()
    };

    let mut controller = Controller::boot(&settings, boiler.sensor(), boiler.relay(), region, 0)?;

    println!("Time(s) | Phase      | Temperature(°C) | Setpoint | Output  | Relay");
    println!("--------|------------|-----------------|----------|---------|------");

    let tick = args.tick_ms.max(1);
    let end = args.duration.saturating_mul(1000);
    let print_every = args.print_every.max(1) * 1000;
    let mut next_print = 0;
    let mut now = 0;
    let mut requests = NoRequests;

    while now < end {
        now += tick;

        if let Some(at) = args.steam_at {
            let due = now >= at.saturating_mul(1000);
            if due && controller.mode() == Mode::Brew && !controller.is_tuning() {
                controller.set_mode(Mode::Steam);
            }
        }

        let cycle = controller.run_once(now, &mut requests)?;
        boiler.advance(tick);

        if now >= next_print {
            let state = controller.state();
            let phase = match cycle {
                Cycle::Tuning => "autotune",
                Cycle::Regulating => "regulating",
            };
            println!(
                "{:7.1} | {:10} | {:15.2} | {:8.1} | {:7.0} | {:?}",
                now as f64 / 1000.0,
                phase,
                boiler.temperature(),
                state.setpoint,
                state.output,
                controller.relay_state()
            );
            next_print += print_every;
        }
    }

    let gains = controller.tunings();
    info!(
        "Final gains: kp {:.3}, ki {:.3}, kd {:.3}",
        gains.kp, gains.ki, gains.kd
    );
    println!("\nSimulation complete!");
    Ok(())
}

/// An already initialized store holding the default record.
fn preset_region(settings: &Settings) -> anyhow::Result<MemoryRegion> {
    let mut store = ConfigStore::new(MemoryRegion::new(), settings.store.version_flag);
    store.save(&settings.default_record())?;
    Ok(store.into_region())
}
