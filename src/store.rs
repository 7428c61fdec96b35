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
//! The run descriptor store: durable mapping from reservation ids (or the `unscheduled` bucket) to
//! experiments. Every mutation is persisted before it returns.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use dispatch_utils::other::unix_timestamp;
use serde_yaml::{Mapping, Value};

use crate::{
    descriptor::{AppliedFirmware, ExperimentDescriptor, QueueEntry, Run},
    error::{DispatchError, ErrorScope},
    injection::{load_additional_runs, write_atomic},
    scheduler::{Reservation, Scheduler},
};

const UNSCHEDULED: &str = "unscheduled";

/// Key of the store. The unscheduled bucket sorts before every reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKey {
    Unscheduled,
    Reservation(u64),
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Unscheduled => write!(f, "{UNSCHEDULED}"),
            StoreKey::Reservation(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEntry {
    Unscheduled(Vec<QueueEntry>),
    Scheduled(ExperimentDescriptor),
}

#[derive(Debug)]
pub struct DescriptorStore {
    path: PathBuf,
    entries: BTreeMap<StoreKey, StoreEntry>,
}

impl DescriptorStore {
    /// Read the store from `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, DispatchError> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("[store] {} does not exist, starting empty", path.display());
                String::new()
            }
            Err(e) => return Err(e.into()),
        };
        let entries = parse(&content)?;
        log::debug!("[store] loaded {} entries from {}", entries.len(), path.display());
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: StoreKey) -> Option<&StoreEntry> {
        self.entries.get(&key)
    }

    pub fn set(&mut self, key: StoreKey, entry: StoreEntry) -> Result<(), DispatchError> {
        self.entries.insert(key, entry);
        self.persist()
    }

    pub fn delete(&mut self, key: StoreKey) -> Result<Option<StoreEntry>, DispatchError> {
        let entry = self.entries.remove(&key);
        if entry.is_some() {
            log::debug!("[store] deleted {key}");
            self.persist()?;
        }
        Ok(entry)
    }

    pub fn list(&self) -> Vec<StoreKey> {
        self.entries.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all scheduled experiments, in increasing order.
    pub fn scheduled_ids(&self) -> Vec<u64> {
        self.entries
            .keys()
            .filter_map(|k| match k {
                StoreKey::Reservation(id) => Some(*id),
                StoreKey::Unscheduled => None,
            })
            .collect()
    }

    pub fn descriptor(&self, id: u64) -> Option<&ExperimentDescriptor> {
        match self.entries.get(&StoreKey::Reservation(id)) {
            Some(StoreEntry::Scheduled(desc)) => Some(desc),
            _ => None,
        }
    }

    /// Snapshot of the pending runs of an experiment.
    pub fn runs(&self, id: u64) -> Vec<Run> {
        self.descriptor(id)
            .map(|d| d.runs.clone())
            .unwrap_or_default()
    }

    /// Modify a scheduled experiment and persist the result.
    pub fn update<F>(&mut self, id: u64, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut ExperimentDescriptor),
    {
        match self.entries.get_mut(&StoreKey::Reservation(id)) {
            Some(StoreEntry::Scheduled(desc)) => f(desc),
            _ => {
                return Err(DispatchError::Config(format!(
                    "no scheduled experiment {id} in the store"
                )))
            }
        }
        self.persist()
    }

    /// Remove the first pending run equal to `run`. Returns whether a run was removed.
    pub fn retire_run(&mut self, id: u64, run: &Run) -> Result<bool, DispatchError> {
        let mut removed = false;
        self.update(id, |desc| {
            if let Some(pos) = desc.runs.iter().position(|r| r == run) {
                desc.runs.remove(pos);
                removed = true;
            }
        })?;
        if !removed {
            log::warn!("[store] run {run:?} of {id} was already removed");
        }
        Ok(removed)
    }

    /// Remember which firmware is flashed onto the nodes of experiment `id`.
    pub fn set_applied(&mut self, id: u64, applied: AppliedFirmware) -> Result<(), DispatchError> {
        self.update(id, |desc| desc.applied = Some(applied))
    }

    /// Move the runs waiting in the injection file in front of the pending runs of `id`. Returns
    /// the number of injected runs.
    pub fn inject_runs(&mut self, path: &Path, id: u64) -> Result<usize, DispatchError> {
        if self.descriptor(id).is_none() {
            return Err(DispatchError::Config(format!(
                "cannot inject runs into unknown experiment {id}"
            )));
        }
        let mut runs = load_additional_runs(path)?;
        let num = runs.len();
        if num > 0 {
            self.update(id, |desc| {
                runs.append(&mut desc.runs);
                desc.runs = runs;
            })?;
            log::info!("[store] injected {num} runs into {id}");
        }
        Ok(num)
    }

    /// Schedule every entry of the `unscheduled` bucket. Each scheduled entry is moved to its
    /// reservation id and persisted before the next one is scheduled. Entries that cannot be
    /// reserved are dropped; entries with a configuration error stay in the bucket.
    pub async fn schedule_unscheduled(
        &mut self,
        scheduler: &Scheduler<'_>,
    ) -> Result<Vec<Reservation>, DispatchError> {
        let pending = match self.entries.get(&StoreKey::Unscheduled) {
            Some(StoreEntry::Unscheduled(entries)) => entries.clone(),
            _ => return Ok(Vec::new()),
        };
        let mut reservations = Vec::new();
        for entry in pending {
            match scheduler.schedule(entry.clone()).await {
                Ok((reservation, desc)) => {
                    self.entries
                        .insert(StoreKey::Reservation(reservation.id), StoreEntry::Scheduled(desc));
                    self.remove_unscheduled(&entry);
                    self.persist()?;
                    reservations.push(reservation);
                }
                Err(e) if e.scope() == ErrorScope::Process => return Err(e),
                Err(e) if e.scope() == ErrorScope::Run => {
                    log::error!("[store] keeping unscheduled entry: {e}");
                }
                Err(e) => {
                    log::error!("[store] dropping unscheduled entry: {e}");
                    self.remove_unscheduled(&entry);
                    self.persist()?;
                }
            }
        }
        if matches!(self.entries.get(&StoreKey::Unscheduled), Some(StoreEntry::Unscheduled(e)) if e.is_empty())
        {
            self.delete(StoreKey::Unscheduled)?;
        }
        Ok(reservations)
    }

    fn remove_unscheduled(&mut self, entry: &QueueEntry) {
        if let Some(StoreEntry::Unscheduled(entries)) = self.entries.get_mut(&StoreKey::Unscheduled) {
            if let Some(pos) = entries.iter().position(|e| e == entry) {
                entries.remove(pos);
            }
        }
    }

    /// Reconstruct the reservations of the experiments with the given ids. Experiments whose
    /// reservation is gone are removed from the store.
    pub async fn reattach_scheduled(
        &mut self,
        scheduler: &Scheduler<'_>,
        ids: &[u64],
    ) -> Result<Vec<Reservation>, DispatchError> {
        let mut reservations = Vec::new();
        for &id in ids {
            let Some(desc) = self.descriptor(id) else {
                continue;
            };
            match scheduler.reattach(id, desc).await {
                Ok(reservation) => reservations.push(reservation),
                Err(e) if e.scope() == ErrorScope::Process => return Err(e),
                Err(e) => {
                    log::error!("[store] dropping experiment {id}: {e}");
                    self.delete(StoreKey::Reservation(id))?;
                }
            }
        }
        Ok(reservations)
    }

    fn persist(&self) -> Result<(), DispatchError> {
        if self.entries.is_empty() {
            return self.rotate();
        }
        let content = serialize(&self.entries)?;
        write_atomic(&self.path, &content)?;
        log::trace!("[store] persisted {} entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    /// Move the file to `<path>.<unix-timestamp>.bkp`.
    fn rotate(&self) -> Result<(), DispatchError> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}.bkp", unix_timestamp()));
        let backup = self.path.with_file_name(name);
        fs::rename(&self.path, &backup)?;
        log::info!("[store] store is empty, moved it to {}", backup.display());
        Ok(())
    }
}

fn parse(content: &str) -> Result<BTreeMap<StoreKey, StoreEntry>, DispatchError> {
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let mapping: Mapping = serde_yaml::from_str(content)
        .map_err(|e| DispatchError::Parse(format!("descriptor file is not a mapping: {e}")))?;
    let mut entries = BTreeMap::new();
    for (key, value) in mapping {
        let key = match &key {
            Value::String(s) if s == UNSCHEDULED => StoreKey::Unscheduled,
            Value::String(s) => StoreKey::Reservation(s.parse().map_err(|_| {
                DispatchError::Parse(format!("unknown key {s:?} in descriptor file"))
            })?),
            Value::Number(n) => StoreKey::Reservation(n.as_u64().ok_or_else(|| {
                DispatchError::Parse(format!("invalid reservation id {n} in descriptor file"))
            })?),
            key => {
                return Err(DispatchError::Parse(format!(
                    "unknown key {key:?} in descriptor file"
                )))
            }
        };
        let entry = match key {
            StoreKey::Unscheduled => {
                if !value.is_sequence() {
                    return Err(DispatchError::Config(format!(
                        "{UNSCHEDULED} must be a list of experiments"
                    )));
                }
                StoreEntry::Unscheduled(serde_yaml::from_value(value).map_err(|e| {
                    DispatchError::Parse(format!("invalid {UNSCHEDULED} entry: {e}"))
                })?)
            }
            StoreKey::Reservation(id) => {
                StoreEntry::Scheduled(serde_yaml::from_value(value).map_err(|e| {
                    DispatchError::Parse(format!("invalid experiment {id}: {e}"))
                })?)
            }
        };
        entries.insert(key, entry);
    }
    Ok(entries)
}

fn serialize(entries: &BTreeMap<StoreKey, StoreEntry>) -> Result<String, DispatchError> {
    let to_value = |e: serde_yaml::Result<Value>| {
        e.map_err(|e| DispatchError::Parse(format!("cannot serialize store: {e}")))
    };
    let mut mapping = Mapping::new();
    for (key, entry) in entries {
        let key = match key {
            StoreKey::Unscheduled => Value::String(UNSCHEDULED.to_string()),
            StoreKey::Reservation(id) => Value::Number((*id).into()),
        };
        let value = match entry {
            StoreEntry::Unscheduled(entries) => to_value(serde_yaml::to_value(entries))?,
            StoreEntry::Scheduled(desc) => to_value(serde_yaml::to_value(desc))?,
        };
        mapping.insert(key, value);
    }
    serde_yaml::to_string(&mapping)
        .map_err(|e| DispatchError::Parse(format!("cannot serialize store: {e}")))
}
