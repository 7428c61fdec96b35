// Testbed Dispatch: Automation of Repeatable Network Experiments on Shared Embedded Testbeds
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
use std::path::PathBuf;

use clap::Parser;

use testbed_dispatch::{descriptor::Run, error::DispatchError, injection, util};

/// Queue runs for the experiment that is currently dispatched. The runs are picked up before the
/// next run of that experiment starts, and are executed before its pending runs.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// YAML file with a list of runs.
    runs_yaml: PathBuf,
    /// Injection file polled by the dispatcher.
    #[arg(default_value = "inject.yaml")]
    inject_yaml: PathBuf,
    /// Add to runs that are still pending in the injection file instead of failing.
    #[arg(short, long)]
    append: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_logging();
    let args = Args::parse();

    let content = std::fs::read_to_string(&args.runs_yaml)?;
    let runs: Vec<Run> = serde_yaml::from_str(&content).map_err(|e| {
        DispatchError::Config(format!("{}: {e}", args.runs_yaml.display()))
    })?;
    if runs.is_empty() {
        log::warn!("[inject] {} contains no runs", args.runs_yaml.display());
        return Ok(());
    }

    let pending = injection::write_runs(&args.inject_yaml, &runs, args.append)?;
    log::info!(
        "[inject] {} runs pending in {}",
        pending,
        args.inject_yaml.display()
    );
    Ok(())
}
