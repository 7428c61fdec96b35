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
use std::{env, path::PathBuf, time::Duration};

use clap::Parser;

use testbed_dispatch::{config::ssh_agent_env, prelude::*, util};

/// Dispatch the experiments of a descriptor file onto the testbed and run them until the queue is
/// empty.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Descriptor file holding the experiment queue.
    #[arg(default_value = "descs.yaml")]
    descs_yaml: PathBuf,
    /// File polled for runs to inject into the running experiment.
    #[arg(default_value = "inject.yaml")]
    inject_yaml: PathBuf,
    /// tmux target (`session[:window[.pane]]`) of the control session. Defaults to a session
    /// named after the experiment.
    #[arg(short, long)]
    tmux_target: Option<String>,
    /// Directory for logs, captures and identity caches.
    #[arg(long, env = "DATA_PATH", default_value = "./results")]
    data_path: PathBuf,
    /// Default firmware application to build.
    #[arg(long, env = "FIRMWARE_PATH", default_value = "./app")]
    firmware_path: PathBuf,
    /// Testbed login. Defaults to the local user.
    #[arg(short, long, env = "IOTLAB_USER")]
    user: Option<String>,
    /// Seconds to wait after the traffic of a run before collecting statistics.
    #[arg(long, default_value_t = 60)]
    drain_margin: u64,
    /// Default testbed site.
    #[arg(long, default_value = "grenoble")]
    site: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_logging();
    let args = Args::parse();

    let user = args
        .user
        .or_else(|| env::var("USER").ok())
        .ok_or("no testbed user given, set --user or IOTLAB_USER")?;

    let config = DispatchConfig {
        descs_path: args.descs_yaml,
        inject_path: args.inject_yaml,
        data_path: args.data_path,
        tmux_target: args.tmux_target,
        user,
        session_env: ssh_agent_env(),
        defaults: Defaults {
            site: args.site,
            firmware_path: args.firmware_path,
            ..Default::default()
        },
        timing: Timing {
            drain_margin: Duration::from_secs(args.drain_margin),
            ..Default::default()
        },
        ..Default::default()
    }
    .with_absolute_paths()?;

    let testbed = IotLabCli::new(&config);
    let builder = RiotBuilder;
    let channels = TmuxFactory::new(&config)?;
    let dispatcher = Dispatcher::new(&config, &testbed, &builder, &channels);

    let summary = dispatcher.run().await?;
    log::info!(
        "[dispatch] done: {} experiments drained ({} runs), {} dropped, {} kept",
        summary.drained,
        summary.runs,
        summary.dropped,
        summary.kept
    );
    Ok(())
}
