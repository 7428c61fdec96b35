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
//! The run controller: drains the runs of one reserved experiment, one timed trial after the
//! other.
//!
//! Each run walks through [`RunPhase::Configuring`] (parameter merge, reflash or reset, identity
//! resolution), [`RunPhase::Capturing`] (only if the experiment sniffs), [`RunPhase::Executing`]
//! (topology setup, traffic, and the fixed wait), [`RunPhase::Collecting`] (statistics) and
//! [`RunPhase::TearingDown`], before the run is retired from the store. The injection file is
//! polled whenever the controller is [`RunPhase::Idle`], so injected runs are picked up before
//! the next pending run starts.

use std::{iter::once, time::SystemTime};

use dispatch_utils::other::{format_local, unix_timestamp};

use crate::{
    config::DispatchConfig,
    control::ControlChannel,
    descriptor::{ExperimentDescriptor, Run},
    error::{DispatchError, ErrorScope},
    firmware::{Firmware, FirmwareBuilder},
    identity::IdentityResolver,
    node::NodeSet,
    protocol::{content_name, Command, ControlLine},
    run_params::{needs_reflash, RunParams},
    scheduler::Reservation,
    session::Capture,
    store::DescriptorStore,
    testbed::Testbed,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum RunPhase {
    Idle,
    Configuring,
    Capturing,
    Executing,
    Collecting,
    TearingDown,
    Drained,
}

/// Commands configuring the forwarding chain and starting the traffic, in the order in which they
/// must be issued. All nodes must have a resolved identity.
pub fn topology_commands(
    desc: &ExperimentDescriptor,
    params: &RunParams,
    nodes: &NodeSet,
) -> Result<Vec<ControlLine>, DispatchError> {
    let mut lines = vec![ControlLine::broadcast(Command::Version)];

    let mut names = Vec::with_capacity(desc.producers.len());
    for producer in &desc.producers {
        let name = content_name(&params.prefix, nodes.l2addr(producer)?);
        lines.push(ControlLine::to(
            producer,
            Command::Produce {
                name: name.clone(),
                data_len: params.data_len,
            },
        ));
        names.push(name);
    }

    // consumer -> forwarders -> producers
    let hops: Vec<&str> = once(desc.consumer.as_str())
        .chain(desc.forwarders.iter().map(String::as_str))
        .collect();
    for hop in hops.windows(2) {
        lines.push(ControlLine::to(
            hop[0],
            Command::Route {
                prefix: params.prefix.clone(),
                next_hop: nodes.l2addr(hop[1])?.clone(),
            },
        ));
    }
    let last = hops[hops.len() - 1];
    for (producer, name) in desc.producers.iter().zip(&names) {
        lines.push(ControlLine::to(
            last,
            Command::Route {
                prefix: name.clone(),
                next_hop: nodes.l2addr(producer)?.clone(),
            },
        ));
    }

    lines.push(ControlLine::to(
        &desc.consumer,
        Command::Consume {
            delay: params.delay,
            count: params.count,
            names,
        },
    ));
    Ok(lines)
}

/// Introspection commands issued to all nodes once the traffic is over.
pub fn statistics_commands() -> Vec<ControlLine> {
    [Command::Pktbuf, Command::SixLoFrag, Command::CcnlCs]
        .into_iter()
        .map(ControlLine::broadcast)
        .collect()
}

pub struct RunController<'a> {
    config: &'a DispatchConfig,
    testbed: &'a dyn Testbed,
    builder: &'a dyn FirmwareBuilder,
    channel: Box<dyn ControlChannel>,
    reservation: Reservation,
    phase: RunPhase,
    capture: Option<Box<dyn Capture>>,
    aggregator_running: bool,
}

impl<'a> RunController<'a> {
    pub fn new(
        config: &'a DispatchConfig,
        testbed: &'a dyn Testbed,
        builder: &'a dyn FirmwareBuilder,
        channel: Box<dyn ControlChannel>,
        reservation: Reservation,
    ) -> Self {
        Self {
            config,
            testbed,
            builder,
            channel,
            reservation,
            phase: RunPhase::Idle,
            capture: None,
            aggregator_running: false,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, phase: RunPhase) {
        log::debug!(
            "[controller] {}: {} -> {phase}",
            self.reservation.name,
            self.phase
        );
        self.phase = phase;
    }

    /// Execute the pending runs of the experiment until none is left. Returns the number of
    /// completed runs.
    pub async fn run(&mut self, store: &mut DescriptorStore) -> Result<usize, DispatchError> {
        let id = self.reservation.id;
        let mut completed = 0;
        loop {
            self.transition(RunPhase::Idle);
            match store.inject_runs(&self.config.inject_path, id) {
                Ok(0) => {}
                Ok(n) => log::info!("[controller] {n} injected runs go first"),
                Err(e) if e.scope() == ErrorScope::Run => {
                    log::error!("[controller] ignoring injected runs: {e}")
                }
                Err(e) => return Err(e),
            }

            let runs = store.runs(id);
            let Some(run) = runs.first() else {
                break;
            };
            let desc = store.descriptor(id).cloned().ok_or_else(|| {
                DispatchError::Config(format!("experiment {id} vanished from the store"))
            })?;
            log::info!(
                "[controller] {}: starting run {} of {}: {run:?}",
                desc.name,
                completed + 1,
                completed + runs.len()
            );
            self.execute(store, &desc, run).await?;
            store.retire_run(id, run)?;
            completed += 1;
        }
        if completed == 0 {
            log::warn!("[controller] {} has no runs", self.reservation.name);
        }
        self.transition(RunPhase::Drained);
        Ok(completed)
    }

    async fn execute(
        &mut self,
        store: &mut DescriptorStore,
        desc: &ExperimentDescriptor,
        run: &Run,
    ) -> Result<(), DispatchError> {
        self.transition(RunPhase::Configuring);
        let params = RunParams::resolve(desc, run, &self.config.defaults)?;
        self.prepare_nodes(store, desc, &params).await?;

        let stem = params.artifact_stem(&desc.name, unix_timestamp());
        let result = self.trial(desc, &params, &stem).await;

        self.transition(RunPhase::TearingDown);
        if result.is_err() && self.aggregator_running {
            if let Err(e) = self.stop_aggregator().await {
                log::warn!("[controller] cannot stop the serial aggregator: {e}");
            }
        }
        self.stop_capture().await;
        result
    }

    /// Reflash or reset the nodes, then make sure all identities are known.
    async fn prepare_nodes(
        &mut self,
        store: &mut DescriptorStore,
        desc: &ExperimentDescriptor,
        params: &RunParams,
    ) -> Result<(), DispatchError> {
        let id = self.reservation.id;
        let config = self.config;
        let resolver = IdentityResolver::new(self.testbed, &config.data_path);
        if needs_reflash(desc.applied, params) {
            log::info!(
                "[controller] {}: reflashing with mode {} (applied: {:?}, requested: {})",
                desc.name,
                params.mode_slug(),
                desc.applied,
                params.reflash
            );
            let firmware = Firmware::new(
                &desc.firmware_path,
                &desc.board,
                &config.firmware_name,
                Firmware::env_for(params.mode, params.vrep, &params.sfr_params, desc.channel),
            );
            let elf = self.builder.build(&firmware).await?;
            self.testbed
                .flash(id, &self.reservation.nodes, &elf)
                .await?;
            resolver.invalidate(&mut self.reservation.nodes)?;
            store.set_applied(id, params.firmware())?;
        } else {
            self.testbed.reset(id, &self.reservation.nodes).await?;
        }
        resolver.resolve(id, &mut self.reservation.nodes).await
    }

    async fn trial(
        &mut self,
        desc: &ExperimentDescriptor,
        params: &RunParams,
        stem: &str,
    ) -> Result<(), DispatchError> {
        let config = self.config;
        let data_path = &config.data_path;
        let wait = params
            .duration
            .checked_add(config.timing.drain_margin)
            .ok_or_else(|| DispatchError::Config("run duration overflows".to_string()))?;

        if desc.sniff {
            self.transition(RunPhase::Capturing);
            self.stop_capture().await;
            let path = data_path.join(format!("{stem}.pcap"));
            let capture = self
                .testbed
                .start_capture(self.reservation.id, self.reservation.nodes.site(), &path)
                .await?;
            self.capture = Some(capture);
        }

        self.transition(RunPhase::Executing);
        let commands = topology_commands(desc, params, &self.reservation.nodes)?;
        self.channel
            .start_serial_aggregator(&data_path.join(format!("{stem}.log")))
            .await?;
        self.aggregator_running = true;
        for line in &commands {
            self.channel.cmd(line).await?;
        }
        log::info!(
            "[controller] {}: waiting {:.0}s for the run to finish (until {})",
            desc.name,
            wait.as_secs_f64(),
            SystemTime::now()
                .checked_add(wait)
                .map(format_local)
                .unwrap_or_else(|| "never".to_string())
        );
        tokio::time::sleep(wait).await;

        self.transition(RunPhase::Collecting);
        self.channel.hit_enter().await?;
        for line in statistics_commands() {
            self.channel.cmd(&line).await?;
            tokio::time::sleep(config.timing.stats_pause).await;
        }
        self.stop_aggregator().await
    }

    async fn stop_aggregator(&mut self) -> Result<(), DispatchError> {
        self.aggregator_running = false;
        self.channel.stop_serial_aggregator().await
    }

    async fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            log::debug!("[controller] stopping capture into {}", capture.path().display());
            capture.stop().await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use itertools::Itertools;

    use super::*;
    use crate::{
        config::Defaults,
        control::ChannelFactory,
        descriptor::QueueEntry,
        node::Identity,
        store::{StoreEntry, StoreKey},
        test::mock::{MockBuilder, MockFactory, MockTestbed, Recorder},
    };

    fn setup(forwarders: &str, producers: &str) -> (ExperimentDescriptor, RunParams, NodeSet) {
        let entry: QueueEntry = serde_yaml::from_str(&format!(
            "{{consumer: m3-1, producers: {producers}, forwarders: {forwarders}, \
              prefix: /test, data_len: 50}}"
        ))
        .unwrap();
        let desc = entry.complete(&Defaults::default()).unwrap();
        let run = Run {
            delay: Some(1000),
            count: Some(10),
            ..Default::default()
        };
        let params = RunParams::resolve(&desc, &run, &Defaults::default()).unwrap();
        let mut nodes = NodeSet::new("grenoble", desc.roles()).unwrap();
        let identities: HashMap<_, _> = nodes
            .iter()
            .map(|n| {
                (
                    n.name().to_string(),
                    Identity {
                        iface: 6,
                        l2addr: format!("{0:02X}:{0:02X}:00:00:00:00:00:{0:02X}", n.id())
                            .parse()
                            .unwrap(),
                    },
                )
            })
            .collect();
        nodes.assign(identities).unwrap();
        (desc, params, nodes)
    }

    fn render(lines: Vec<ControlLine>) -> Vec<String> {
        lines.into_iter().map(|l| l.to_string()).collect_vec()
    }

    #[test]
    fn chain_with_forwarders() {
        let (desc, params, nodes) = setup("[m3-3, m3-4]", "[m3-2]");
        assert_eq!(
            render(topology_commands(&desc, &params, &nodes).unwrap()),
            vec![
                "version",
                "m3-2;produce /test/02:02 50",
                "m3-1;route /test 03:03:00:00:00:00:00:03",
                "m3-3;route /test 04:04:00:00:00:00:00:04",
                "m3-4;route /test/02:02 02:02:00:00:00:00:00:02",
                "m3-1;consume 1000 10 /test/02:02",
            ]
        );
    }

    #[test]
    fn chain_without_forwarders() {
        let (desc, params, nodes) = setup("[]", "[m3-2, m3-5]");
        assert_eq!(
            render(topology_commands(&desc, &params, &nodes).unwrap()),
            vec![
                "version",
                "m3-2;produce /test/02:02 50",
                "m3-5;produce /test/05:05 50",
                "m3-1;route /test/02:02 02:02:00:00:00:00:00:02",
                "m3-1;route /test/05:05 05:05:00:00:00:00:00:05",
                "m3-1;consume 1000 10 /test/02:02 /test/05:05",
            ]
        );
    }

    #[test]
    fn unresolved_node() {
        let (desc, params, mut nodes) = setup("[m3-3]", "[m3-2]");
        nodes.invalidate();
        assert!(matches!(
            topology_commands(&desc, &params, &nodes),
            Err(DispatchError::Topology(_))
        ));
    }

    #[test]
    fn statistics() {
        assert_eq!(
            render(statistics_commands()),
            vec!["pktbuf", "6lo_frag", "ccnl_cs"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn phases_end_drained() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            data_path: dir.path().to_path_buf(),
            inject_path: dir.path().join("inject.yaml"),
            ..Default::default()
        };
        let log = Recorder::default();
        let testbed = MockTestbed::new(&log);
        let builder = MockBuilder::new(&log);

        let (mut desc, _, nodes) = setup("[m3-3]", "[m3-2]");
        desc.runs = vec![Run {
            count: Some(1),
            ..Default::default()
        }];
        let mut store = DescriptorStore::load(dir.path().join("descs.yaml")).unwrap();
        store
            .set(StoreKey::Reservation(7), StoreEntry::Scheduled(desc.clone()))
            .unwrap();
        let reservation = Reservation {
            id: 7,
            name: desc.name.clone(),
            nodes,
        };
        let channel = MockFactory::new(&log).open(&reservation).await.unwrap();

        let mut controller = RunController::new(&config, &testbed, &builder, channel, reservation);
        assert_eq!(controller.phase(), RunPhase::Idle);
        assert_eq!(controller.run(&mut store).await.unwrap(), 1);
        assert_eq!(controller.phase(), RunPhase::Drained);
        assert!(store.runs(7).is_empty());
        assert_eq!(log.count("flash"), 1);
        assert_eq!(log.count("stop_aggregator"), 1);

        // nothing left: drained right away
        assert_eq!(controller.run(&mut store).await.unwrap(), 0);
        assert_eq!(controller.phase(), RunPhase::Drained);
    }
}
