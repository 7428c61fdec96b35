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
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use tempfile::TempDir;

use super::mock::{MockBuilder, MockFactory, MockProbe, MockTestbed, Recorder};
use crate::{
    config::DispatchConfig,
    descriptor::{QueueEntry, Run},
    dispatch::{DispatchSummary, Dispatcher},
    error::DispatchError,
    scheduler::Scheduler,
    store::{DescriptorStore, StoreEntry, StoreKey},
    testbed::ExperimentState,
};

const CHAIN: &str = r#"
unscheduled:
  - consumer: m3-1
    producers: [m3-2]
    forwarders: [m3-3]
    mode: sfr
    sfr_params: {win: 1, ifg: 100, arq: 150, frag: 4, dg: 0}
    prefix: /test
    data_len: 50
    runs:
      - {delay: 1000, count: 10}
"#;

fn two_runs(extra: &str) -> String {
    format!(
        r#"
unscheduled:
  - consumer: m3-1
    producers: [m3-2]
    forwarders: [m3-3]
    prefix: /test
    data_len: 50{extra}
    runs:
      - {{count: 1}}
      - {{count: 2}}
"#
    )
}

struct Harness {
    dir: TempDir,
    config: DispatchConfig,
    log: Recorder,
    testbed: MockTestbed,
    builder: MockBuilder,
    channels: MockFactory,
}

impl Harness {
    fn new(descs: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("descs.yaml"), descs).unwrap();
        let config = DispatchConfig {
            descs_path: dir.path().join("descs.yaml"),
            inject_path: dir.path().join("inject.yaml"),
            data_path: dir.path().join("results"),
            user: "alice".to_string(),
            ..Default::default()
        };
        let log = Recorder::default();
        Self {
            testbed: MockTestbed::new(&log),
            builder: MockBuilder::new(&log),
            channels: MockFactory::new(&log),
            dir,
            config,
            log,
        }
    }

    async fn dispatch(&self) -> Result<DispatchSummary, DispatchError> {
        Dispatcher::new(&self.config, &self.testbed, &self.builder, &self.channels)
            .run()
            .await
    }

    fn store(&self) -> DescriptorStore {
        DescriptorStore::load(&self.config.descs_path).unwrap()
    }

    /// Request counts of all issued `consume` commands, in order.
    fn consumed_counts(&self) -> Vec<u64> {
        self.log
            .args_of("cmd")
            .iter()
            .filter_map(|c| c.split_once(";consume "))
            .map(|(_, args)| args.split(' ').nth(1).unwrap().parse().unwrap())
            .collect()
    }

    fn backups(&self) -> usize {
        fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bkp"))
            .count()
    }
}

fn position(events: &[String], prefix: &str) -> usize {
    events
        .iter()
        .position(|e| e.starts_with(prefix))
        .unwrap_or_else(|| panic!("no event {prefix:?} in {events:#?}"))
}

#[tokio::test(start_paused = true)]
async fn single_chain() {
    let h = Harness::new(CHAIN);
    let start = tokio::time::Instant::now();
    let summary = h.dispatch().await.unwrap();
    assert_eq!(
        summary,
        DispatchSummary {
            drained: 1,
            runs: 1,
            dropped: 0,
            kept: 0
        }
    );

    // 10 requests every second take 40s, plus the drain margin
    assert!(start.elapsed() >= Duration::from_secs(100));

    // built once for the reservation, and once for the reflash before the first run
    assert_eq!(h.log.count("build"), 2);
    assert_eq!(h.log.count("flash"), 1);
    assert_eq!(h.log.count("reset"), 0);

    let p1 = MockProbe::l2addr("m3-2");
    let f1 = MockProbe::l2addr("m3-3");
    assert_eq!(
        h.log.args_of("cmd"),
        vec![
            "version".to_string(),
            format!("m3-2;produce /test/{} 50", p1.prefix()),
            format!("m3-1;route /test {f1}"),
            format!("m3-3;route /test/{} {p1}", p1.prefix()),
            format!("m3-1;consume 1000 10 /test/{}", p1.prefix()),
            "pktbuf".to_string(),
            "6lo_frag".to_string(),
            "ccnl_cs".to_string(),
        ]
    );

    let events = h.log.events();
    assert!(position(&events, "wait_running") < position(&events, "open_channel"));
    assert!(position(&events, "ctrl_c") < position(&events, "flash"));
    assert!(position(&events, "flash") < position(&events, "open_probe"));
    assert!(position(&events, "close_probe") < position(&events, "start_aggregator"));
    assert!(position(&events, "enter") < position(&events, "cmd pktbuf"));
    assert!(position(&events, "cmd ccnl_cs") < position(&events, "stop_aggregator"));

    assert!(!h.config.descs_path.exists());
    assert_eq!(h.backups(), 1);
}

#[tokio::test(start_paused = true)]
async fn injected_runs_go_first() {
    let h = Harness::new(&two_runs(""));
    fs::write(&h.config.inject_path, "- {count: 3}\n- {count: 4}\n").unwrap();

    let summary = h.dispatch().await.unwrap();
    assert_eq!(summary.runs, 4);
    assert_eq!(h.consumed_counts(), vec![3, 4, 1, 2]);
    assert!(!h.config.inject_path.exists());

    // the firmware stays valid after the first run
    assert_eq!(h.log.count("flash"), 1);
    assert_eq!(h.log.count("reset"), 3);
    // identities are probed once and cached afterwards
    assert_eq!(h.log.count("open_probe"), 1);
}

#[tokio::test(start_paused = true)]
async fn injection_with_reflash_during_run() {
    let h = Harness::new(&two_runs(""));
    h.channels.inject_on_consume(
        &h.config.inject_path,
        "- {count: 5, mode: reass, reflash: true}\n",
    );

    let summary = h.dispatch().await.unwrap();
    assert_eq!(summary.runs, 3);
    assert_eq!(h.consumed_counts(), vec![1, 5, 2]);
    assert_eq!(
        h.log.args_of("build"),
        vec![
            "MODE=sfr VREP=1",
            "MODE=sfr VREP=1",
            "MODE=reass VREP=1",
            "MODE=sfr VREP=1"
        ]
    );
    assert_eq!(h.log.count("flash"), 3);
    // every reflash invalidates the identities
    assert_eq!(h.log.count("open_probe"), 3);
}

#[tokio::test(start_paused = true)]
async fn reflash_flag_with_same_firmware() {
    let h = Harness::new(&two_runs(""));
    h.channels
        .inject_on_consume(&h.config.inject_path, "- {count: 5, reflash: true}\n");

    let summary = h.dispatch().await.unwrap();
    assert_eq!(summary.runs, 3);
    assert_eq!(h.consumed_counts(), vec![1, 5, 2]);
    assert_eq!(h.log.args_of("build"), vec!["MODE=sfr VREP=1"; 3]);
    // the flag alone forces the second flash, the last run only resets
    assert_eq!(h.log.count("flash"), 2);
    assert_eq!(h.log.count("reset"), 1);
    assert_eq!(h.log.count("open_probe"), 2);
}

#[tokio::test(start_paused = true)]
async fn vrep_change_reflashes() {
    let h = Harness::new(&two_runs("").replace("{count: 2}", "{count: 2, vrep: false}"));
    h.dispatch().await.unwrap();
    assert_eq!(
        h.log.args_of("build"),
        vec!["MODE=sfr VREP=1", "MODE=sfr VREP=1", "MODE=sfr VREP=0"]
    );
    assert_eq!(h.log.count("reset"), 0);
}

#[tokio::test(start_paused = true)]
async fn capture_and_session_env() {
    let mut h = Harness::new(&two_runs("\n    sniff: true"));
    h.config.session_env = BTreeMap::from([
        ("SSH_AUTH_SOCK".to_string(), "/tmp/agent.sock".to_string()),
        ("SSH_AGENT_PID".to_string(), "42".to_string()),
    ]);
    h.dispatch().await.unwrap();

    let events = h.log.events();
    let open = position(&events, "open_channel");
    assert_eq!(
        events[open + 1..open + 5],
        [
            "export SSH_AGENT_PID=42",
            "export SSH_AUTH_SOCK=/tmp/agent.sock",
            "ctrl_c",
            "ctrl_c"
        ]
    );
    assert_eq!(h.log.count("add_profile"), 1);
    assert_eq!(h.log.count("start_capture"), 2);
    assert_eq!(h.log.count("stop_capture"), 2);
    assert!(position(&events, "start_capture") < position(&events, "start_aggregator"));
    assert!(position(&events, "stop_aggregator") < position(&events, "stop_capture"));

    // log and capture of a run share their name
    let capture = h.log.args_of("start_capture")[0].clone();
    let log = h.log.args_of("start_aggregator")[0].clone();
    let capture = capture.split_once(' ').unwrap().1;
    assert_eq!(
        Path::new(capture).with_extension("log"),
        Path::new(&log).to_path_buf()
    );
    assert!(log.contains("icnlowpan_comp_cr_c20_msfr-win1ifg100arq150r4dg0-vrep-1x1000ms50B_"));
}

#[tokio::test(start_paused = true)]
async fn empty_run_list() {
    let h = Harness::new(
        "unscheduled:\n  - {consumer: m3-1, producers: [m3-2], forwarders: [], runs: []}\n",
    );
    let summary = h.dispatch().await.unwrap();
    assert_eq!(summary.drained, 1);
    assert_eq!(summary.runs, 0);
    assert_eq!(h.log.count("build"), 1);
    assert_eq!(h.log.count("start_aggregator"), 0);
    assert!(!h.config.descs_path.exists());
}

#[tokio::test(start_paused = true)]
async fn error_isolation() {
    let entry = |channel: u8, nodes: &str, prefix: &str| {
        format!(
            "  - {{consumer: m3-{nodes}1, producers: [m3-{nodes}2], forwarders: [], \
             channel: {channel}{prefix}, data_len: 50, runs: [{{count: 1}}]}}\n"
        )
    };
    let descs = format!(
        "unscheduled:\n{}{}{}{}",
        entry(11, "1", ", prefix: /a"),
        entry(12, "2", ", prefix: /b"),
        entry(13, "3", ", prefix: /c"),
        entry(14, "4", ""),
    );
    let h = Harness::new(&descs);
    h.testbed.fail_wait_for(1002);
    h.testbed.set_unmanaged("m3-32");

    let summary = h.dispatch().await.unwrap();
    assert_eq!(
        summary,
        DispatchSummary {
            drained: 1,
            runs: 1,
            dropped: 2,
            kept: 1
        }
    );

    // the experiment without prefix stays for the operator, with its run
    let store = h.store();
    assert_eq!(store.scheduled_ids(), vec![1004]);
    assert_eq!(store.runs(1004).len(), 1);
    assert_eq!(store.descriptor(1004).unwrap().name, "icnlowpan_comp_cr_c14");
}

#[tokio::test(start_paused = true)]
async fn reattach_existing_reservations() {
    let h = Harness::new("");
    let entry: QueueEntry = serde_yaml::from_str(
        "{consumer: m3-1, producers: [m3-2], forwarders: [], prefix: /test, data_len: 50, \
          runs: [{count: 1}]}",
    )
    .unwrap();
    let desc = entry.complete(&h.config.defaults).unwrap();
    let mut store = h.store();
    store
        .set(StoreKey::Reservation(77), StoreEntry::Scheduled(desc.clone()))
        .unwrap();
    store
        .set(StoreKey::Reservation(78), StoreEntry::Scheduled(desc))
        .unwrap();
    h.testbed.set_state(78, ExperimentState::Terminated);

    let summary = h.dispatch().await.unwrap();
    assert_eq!(summary.drained, 1);
    assert_eq!(h.log.count("submit"), 0);
    assert_eq!(h.log.args_of("wait_running"), vec!["77"]);
    assert!(!h.config.descs_path.exists());
}

#[tokio::test]
async fn request_round_trip() {
    let h = Harness::new(&two_runs("\n    sniff: true"));
    let scheduler = Scheduler::new(&h.config, &h.testbed, &h.builder);
    let mut store = h.store();
    let reservations = store.schedule_unscheduled(&scheduler).await.unwrap();
    let submitted = h.testbed.requests();

    let reloaded = h.store();
    let desc = reloaded.descriptor(reservations[0].id).unwrap();
    let request = scheduler.request(desc).await.unwrap();
    assert_eq!(request, submitted[0]);
    assert_eq!(reservations[0].nodes, request.nodes);
}

#[tokio::test]
async fn corrupt_store_is_fatal() {
    let h = Harness::new("1234: [not, a, descriptor]\n");
    assert!(matches!(h.dispatch().await, Err(DispatchError::Parse(_))));
}

#[test]
fn run_defaults_in_descriptor_file() {
    let runs: Vec<Run> = serde_yaml::from_str("- {}\n- {reflash: true}\n").unwrap();
    assert_eq!(runs[0], Run::default());
    assert_eq!(runs[1].reflash, Some(true));
}
