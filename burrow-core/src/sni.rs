//! Privacy-preserving reporting of SNIs that kept failing.
//!
//! When a retried HTTPS flow still moved no downstream bytes, the blocked
//! server name is worth reporting. Raw events are reduced here to counts
//! keyed by a hash of the name's registrable suffix and the user's country;
//! the batching protocol that ships them is an external collaborator, this
//! module only feeds it and persists its aggregation state.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::tcp::TcpSocketSummary;

struct Event {
    sni: String,
    success: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReporterState {
    suffix: String,
    country: String,
    counts: HashMap<String, u64>,
}

/// Collects failed-SNI events behind a channel; one aggregator task owns the
/// state and the file. Unconfigured reporters drop events.
#[derive(Clone, Default)]
pub struct SniReporter {
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<Event>>>>,
}

impl SniReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the aggregator. `file` holds persisted state across sessions,
    /// `suffix` is the authoritative domain reports are destined for, and
    /// `country` is a lower-case ISO code.
    pub fn configure(&self, file: std::fs::File, suffix: &str, country: &str) -> Result<()> {
        let mut state = load_state(&file).unwrap_or_default();
        state.suffix = suffix.to_string();
        state.country = country.to_string();

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            let mut file = file;
            while let Some(event) = rx.recv().await {
                if event.success {
                    continue;
                }
                let key = format!("{:016x}:{}", suffix_hash(&event.sni), state.country);
                *state.counts.entry(key).or_insert(0) += 1;
                if let Err(e) = persist(&mut file, &state) {
                    warn!(error = %e, "failed to persist SNI report state");
                }
            }
            debug!("SNI reporter stopped");
        });
        *self.tx.write() = Some(tx);
        Ok(())
    }

    /// Feed one closed-socket summary. Only summaries whose retry actually
    /// fired are interesting; success is downstream bytes after the retry.
    pub fn report(&self, summary: &TcpSocketSummary) {
        let Some(retry) = &summary.retry else {
            return;
        };
        if retry.split == 0 || retry.sni.is_empty() {
            return;
        }
        let event = Event {
            sni: retry.sni.clone(),
            success: summary.download_bytes > 0,
        };
        if let Some(tx) = &*self.tx.read() {
            let _ = tx.send(event);
        }
    }
}

/// Hash of the registrable-ish suffix (last two labels) of a server name.
fn suffix_hash(sni: &str) -> u64 {
    let mut labels: Vec<&str> = sni.rsplit('.').filter(|l| !l.is_empty()).collect();
    labels.truncate(2);
    labels.reverse();
    let suffix = labels.join(".");
    let digest = Sha256::digest(suffix.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word)
}

fn load_state(mut file: &std::fs::File) -> Option<ReporterState> {
    file.seek(SeekFrom::Start(0)).ok()?;
    serde_json::from_reader(file).ok()
}

fn persist(file: &mut std::fs::File, state: &ReporterState) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut *file, state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_net::retry::RetryStats;
    use std::time::Duration;

    fn failed_summary(sni: &str) -> TcpSocketSummary {
        TcpSocketSummary {
            download_bytes: 0,
            server_port: 443,
            retry: Some(RetryStats {
                sni: sni.to_string(),
                bytes: 200,
                chunks: 1,
                split: 40,
                timeout_ms: 1200,
            }),
            ..Default::default()
        }
    }

    fn temp_file(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("burrow-sni-{name}-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (path, file)
    }

    async fn wait_for_state(path: &std::path::Path) -> ReporterState {
        for _ in 0..200 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(state) = serde_json::from_str::<ReporterState>(&text) {
                    if !state.counts.is_empty() {
                        return state;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reporter never persisted state");
    }

    #[tokio::test]
    async fn failed_retries_are_counted_and_persisted() {
        let (path, file) = temp_file("counts");
        let reporter = SniReporter::new();
        reporter.configure(file, "report.example", "us").unwrap();

        reporter.report(&failed_summary("blocked.example.com"));
        reporter.report(&failed_summary("blocked.example.com"));

        let state = wait_for_state(&path).await;
        assert_eq!(state.suffix, "report.example");
        assert_eq!(state.country, "us");
        assert_eq!(state.counts.len(), 1);
        assert_eq!(state.counts.values().sum::<u64>(), 2);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn successful_retries_are_not_counted() {
        let (path, file) = temp_file("success");
        let reporter = SniReporter::new();
        reporter.configure(file, "report.example", "us").unwrap();

        let mut summary = failed_summary("ok.example.com");
        summary.download_bytes = 4096;
        reporter.report(&summary);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let text = std::fs::read_to_string(&path).unwrap_or_default();
        assert!(text.is_empty() || !text.contains(':'));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn no_retry_means_no_event() {
        let (path, file) = temp_file("noretry");
        let reporter = SniReporter::new();
        reporter.configure(file, "report.example", "us").unwrap();

        let mut summary = failed_summary("irrelevant.example");
        summary.retry.as_mut().unwrap().split = 0;
        reporter.report(&summary);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let text = std::fs::read_to_string(&path).unwrap_or_default();
        assert!(text.is_empty() || !text.contains(':'));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn unconfigured_reporter_drops_events() {
        let reporter = SniReporter::new();
        reporter.report(&failed_summary("whatever.example"));
    }

    #[test]
    fn suffix_hash_groups_subdomains() {
        assert_eq!(
            suffix_hash("a.blocked.example.com"),
            suffix_hash("b.blocked.example.com")
        );
        assert_ne!(suffix_hash("example.com"), suffix_hash("example.org"));
    }
}
