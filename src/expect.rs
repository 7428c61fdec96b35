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
//! Expect-style interaction with a line-oriented remote process: send lines, then wait until the
//! output matches one of several patterns.

use std::time::Duration;

use itertools::Itertools;
use regex::Regex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};

use crate::error::DispatchError;

/// Output that was not matched yet is kept up to this many bytes.
const MAX_BUFFER: usize = 1 << 16;

/// Result of a successful [`ExpectSession::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the pattern that matched.
    pub index: usize,
    /// All capture groups; the first one is the entire match. Groups that did not participate are
    /// empty.
    pub groups: Vec<String>,
}

impl ExpectMatch {
    pub fn group(&self, i: usize) -> &str {
        self.groups.get(i).map(String::as_str).unwrap_or_default()
    }
}

pub struct ExpectSession<R, W> {
    name: String,
    reader: R,
    writer: W,
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
}

impl<R, W> ExpectSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            buffer: String::new(),
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send_line(&mut self, line: impl AsRef<str>) -> Result<(), DispatchError> {
        log::trace!("[{}] > {}", self.name, line.as_ref());
        let mut data = line.as_ref().as_bytes().to_vec();
        data.push(b'\n');
        self.writer
            .write_all(&data)
            .await
            .map_err(|e| DispatchError::Channel(format!("{}: {e}", self.name)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| DispatchError::Channel(format!("{}: {e}", self.name)))
    }

    /// Wait until the output contains a match of any of the `patterns`. If several patterns match,
    /// the one matching earliest in the output wins (ties go to the lower index). Everything up to
    /// the end of the match is consumed.
    pub async fn expect(
        &mut self,
        patterns: &[&Regex],
        timeout: Duration,
    ) -> Result<ExpectMatch, DispatchError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(m) = self.find(patterns) {
                return Ok(m);
            }
            let n = match tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await {
                Err(_) => {
                    return Err(DispatchError::Timeout(format!(
                        "[{}] on {}",
                        patterns.iter().map(|p| p.as_str()).join(" | "),
                        self.name
                    )))
                }
                Ok(Err(e)) => return Err(DispatchError::Channel(format!("{}: {e}", self.name))),
                Ok(Ok(0)) => {
                    return Err(DispatchError::Channel(format!(
                        "{} closed its output",
                        self.name
                    )))
                }
                Ok(Ok(n)) => n,
            };
            self.pending.extend_from_slice(&chunk[..n]);
            let received = self.decode();
            log::trace!("[{}] < {}", self.name, received.trim_end());
            self.buffer.push_str(&received);
            self.trim();
        }
    }

    fn find(&mut self, patterns: &[&Regex]) -> Option<ExpectMatch> {
        let (index, start, end, groups) = patterns
            .iter()
            .enumerate()
            .filter_map(|(i, re)| {
                let caps = re.captures(&self.buffer)?;
                let whole = caps.get(0)?;
                let groups = caps
                    .iter()
                    .map(|g| g.map(|g| g.as_str().to_string()).unwrap_or_default())
                    .collect_vec();
                Some((i, whole.start(), whole.end(), groups))
            })
            .min_by_key(|(i, start, _, _)| (*start, *i))?;
        log::trace!("[{}] matched pattern {index} at {start}", self.name);
        self.buffer.drain(..end);
        Some(ExpectMatch { index, groups })
    }

    /// Take the decodable prefix of the pending bytes. Incomplete sequences at the end wait for
    /// the next read, invalid ones become replacement characters.
    fn decode(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    let Some(bad) = e.error_len() else {
                        out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                        self.pending.drain(..valid);
                        return out;
                    };
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid + bad]));
                    self.pending.drain(..valid + bad);
                }
            }
        }
    }

    fn trim(&mut self) {
        if self.buffer.len() <= MAX_BUFFER {
            return;
        }
        let mut cut = self.buffer.len() - MAX_BUFFER / 2;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn earliest_match_wins() {
        let (mut remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);

        remote.write_all(b"foo 1\nbar 2\nfoo 3\n").await.unwrap();
        let foo = Regex::new(r"foo (\d)").unwrap();
        let bar = Regex::new(r"bar (\d)").unwrap();

        let m = session
            .expect(&[&bar, &foo], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(m.index, 1);
        assert_eq!(m.group(1), "1");

        let m = session
            .expect(&[&bar, &foo], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(m.index, 0);
        assert_eq!(m.group(1), "2");

        let m = session
            .expect(&[&foo], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(m.group(1), "3");
    }

    #[tokio::test]
    async fn match_across_chunks() {
        let (mut remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);
        let re = Regex::new(r"Aggregator started").unwrap();

        let handle = tokio::spawn(async move {
            remote.write_all(b"Aggreg").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.write_all(b"ator started\n").await.unwrap();
            remote
        });
        session.expect(&[&re], Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn multibyte_split_across_chunks() {
        let (mut remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);
        let re = Regex::new(r"caf(é) ok").unwrap();

        let bytes = "café ok\n".as_bytes().to_vec();
        let handle = tokio::spawn(async move {
            // split inside the two bytes of 'é'
            remote.write_all(&bytes[..4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.write_all(&bytes[4..]).await.unwrap();
            remote
        });
        let m = session.expect(&[&re], Duration::from_secs(5)).await.unwrap();
        assert_eq!(m.group(1), "é");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_bytes_are_replaced() {
        let (mut remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);
        let re = Regex::new("a\u{fffd}b").unwrap();

        remote.write_all(b"a\xffb\n").await.unwrap();
        session.expect(&[&re], Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout() {
        let (_remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);
        let re = Regex::new(r"never").unwrap();
        let err = session
            .expect(&[&re], Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_output() {
        let (remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);
        drop(remote);
        let re = Regex::new(r"never").unwrap();
        let err = session
            .expect(&[&re], Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Channel(_)));
    }

    #[tokio::test]
    async fn send_line_appends_newline() {
        let (mut remote, local) = duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut session = ExpectSession::new("test", reader, writer);
        session.send_line("m3-1;ifconfig").await.unwrap();
        let mut buf = [0u8; 14];
        tokio::io::AsyncReadExt::read_exact(&mut remote, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"m3-1;ifconfig\n");
    }
}
