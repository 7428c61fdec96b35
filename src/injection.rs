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
//! The injection file: a YAML list of runs dropped next to the descriptor file by an operator, and
//! picked up by the dispatcher at the start of the next run.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use dispatch_utils::other::unix_timestamp;

use crate::{descriptor::Run, error::DispatchError};

/// `<path>.tmp`, used to replace files atomically.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `content` to `path` via a temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), DispatchError> {
    let tmp = tmp_path(path);
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn parse_runs(content: &str) -> Result<Vec<Run>, DispatchError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(content)
        .map_err(|e| DispatchError::Config(format!("invalid run list: {e}")))
}

/// Consume the injection file. A missing file yields no runs. A malformed file is moved aside to
/// `<path>.<unix-timestamp>.rejected` so that it is not read again.
pub fn load_additional_runs(path: &Path) -> Result<Vec<Run>, DispatchError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    match parse_runs(&content) {
        Ok(runs) => {
            fs::remove_file(path)?;
            log::info!("[injection] loaded {} runs from {}", runs.len(), path.display());
            Ok(runs)
        }
        Err(e) => {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(format!(".{}.rejected", unix_timestamp()));
            let rejected = path.with_file_name(name);
            fs::rename(path, &rejected)?;
            log::error!(
                "[injection] moved malformed {} to {}",
                path.display(),
                rejected.display()
            );
            Err(e)
        }
    }
}

/// Write `runs` into the injection file. If runs are already pending, they are kept in front of
/// the new ones when `append` is set, otherwise the call fails.
pub fn write_runs(path: &Path, runs: &[Run], append: bool) -> Result<usize, DispatchError> {
    let mut all = match fs::read_to_string(path) {
        Ok(_) if !append => {
            return Err(DispatchError::Config(format!(
                "{} already contains pending runs",
                path.display()
            )))
        }
        Ok(content) => parse_runs(&content)?,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    all.extend_from_slice(runs);
    let content = serde_yaml::to_string(&all)
        .map_err(|e| DispatchError::Config(format!("cannot serialize runs: {e}")))?;
    write_atomic(path, &content)?;
    Ok(all.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::Mode;

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_additional_runs(&dir.path().join("inject.yaml"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn consume_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inject.yaml");
        fs::write(&path, "- mode: reass\n  reflash: true\n- delay: 500\n").unwrap();
        let runs = load_additional_runs(&path).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].mode, Some(Mode::Reass));
        assert_eq!(runs[0].reflash, Some(true));
        assert_eq!(runs[1].delay, Some(500));
        assert!(!path.exists());
        assert!(load_additional_runs(&path).unwrap().is_empty());
    }

    #[test]
    fn reject_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inject.yaml");
        fs::write(&path, "- mode: turbo\n").unwrap();
        assert!(matches!(
            load_additional_runs(&path),
            Err(DispatchError::Config(_))
        ));
        assert!(!path.exists());
        let rejected = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".rejected"))
            .count();
        assert_eq!(rejected, 1);
    }

    #[test]
    fn write_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inject.yaml");
        let a = Run {
            count: Some(10),
            ..Default::default()
        };
        let b = Run {
            vrep: Some(false),
            ..Default::default()
        };
        assert_eq!(write_runs(&path, &[a.clone()], false).unwrap(), 1);
        assert!(write_runs(&path, &[b.clone()], false).is_err());
        assert_eq!(write_runs(&path, &[b.clone()], true).unwrap(), 2);
        assert!(!tmp_path(&path).exists());
        assert_eq!(load_additional_runs(&path).unwrap(), vec![a, b]);
    }
}
