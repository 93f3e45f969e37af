//! Durable per-query log.
//!
//! One JSON Lines record per resolved query, carrying everything the
//! external reporting tooling reads: timing, the servers visited, cache
//! status, and the final outcome. Records flow over a channel to a single
//! writer task, so concurrent queries can never interleave mid-line.

use std::net::SocketAddr;

use chrono::{SecondsFormat, Utc};
use log::warn;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::dns::Question;
use crate::errors::DnsError;
use crate::resolver::{Resolution, ResolutionResult};

/// One upstream server contacted during a resolution.
#[derive(Debug, Serialize)]
pub struct HopRecord {
    pub server: String,
    pub outcome: String,
    pub rtt_ms: f64,
}

/// The durable record written for every query.
#[derive(Debug, Serialize)]
pub struct QueryRecord {
    pub timestamp: String,
    pub client: String,
    pub qname: String,
    pub qtype: String,
    pub cache_hit: bool,
    pub hops: Vec<HopRecord>,
    pub outcome: String,
    pub answers: Vec<String>,
    pub failure: Option<String>,
    pub total_ms: f64,
}

impl QueryRecord {
    /// Build the log record for a finished resolution.
    pub fn from_resolution(client: SocketAddr, question: &Question, resolution: &Resolution) -> Self {
        let hops = resolution
            .trace
            .iter()
            .map(|hop| HopRecord {
                server: hop.server.to_string(),
                outcome: hop.outcome.to_string(),
                rtt_ms: hop.rtt.as_secs_f64() * 1000.0,
            })
            .collect();

        let (outcome, answers, failure) = match &resolution.result {
            ResolutionResult::Answered(records) => (
                "answered".to_string(),
                records.iter().map(|record| record.data.to_string()).collect(),
                None,
            ),
            ResolutionResult::Failed(reason) => {
                ("failed".to_string(), Vec::new(), Some(reason.to_string()))
            }
        };

        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            client: client.to_string(),
            qname: question.name.clone(),
            qtype: question.qtype.to_string(),
            cache_hit: resolution.cache_hit,
            hops,
            outcome,
            answers,
            failure,
            total_ms: resolution.elapsed.as_secs_f64() * 1000.0,
        }
    }
}

/// Handle for emitting query records. Cheap to clone; all clones feed the
/// same writer task.
#[derive(Clone)]
pub struct QueryLog {
    tx: mpsc::UnboundedSender<QueryRecord>,
}

impl QueryLog {
    /// Open the log file and start the writer task.
    ///
    /// Failing to open the file is a fatal configuration error; a write
    /// failure after startup drops the record and keeps serving.
    pub async fn open(path: &str) -> Result<Self, DnsError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DnsError::Config(format!("Cannot open query log {}: {}", path, e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<QueryRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to serialize query record: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("Query log write failed: {}", e);
                    continue;
                }
                if let Err(e) = file.flush().await {
                    warn!("Query log flush failed: {}", e);
                }
            }
        });

        Ok(Self { tx })
    }

    /// Emit one record. Never blocks the calling query task.
    pub fn record(&self, record: QueryRecord) {
        if self.tx.send(record).is_err() {
            warn!("Query log writer is gone, dropping record");
        }
    }
}
