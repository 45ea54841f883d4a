//! Concrete documents of the state directory.
//!
//! Scalars are plain text (one value and a newline, empty meaning unset);
//! structured documents are pretty JSON, except the iteration log which is
//! JSON lines.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::store::{Document, to_json_pretty};
use crate::core::opportunity::OpportunityBook;
use crate::core::promotion::PromotionLedger;
use crate::core::types::{
    Champion, ExecutionGateRecord, IterationId, IterationRecord, Watermarks,
};

/// Last claimed iteration id (0 before the first iteration).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationCounter(pub IterationId);

impl Document for IterationCounter {
    const FILE: &'static str = "iteration_counter";

    fn decode(contents: &str) -> Result<Self> {
        let value = contents.trim();
        if value.is_empty() {
            return Ok(Self(0));
        }
        value
            .parse()
            .map(Self)
            .with_context(|| format!("invalid iteration counter {value:?}"))
    }

    fn encode(&self) -> Result<String> {
        Ok(format!("{}\n", self.0))
    }
}

/// Mirror of `champion.json`'s effective score, for quick external reads.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChampionScore(pub Option<f64>);

impl Document for ChampionScore {
    const FILE: &'static str = "champion_score";

    fn decode(contents: &str) -> Result<Self> {
        let value = contents.trim();
        if value.is_empty() {
            return Ok(Self(None));
        }
        let score: f64 = value
            .parse()
            .with_context(|| format!("invalid champion score {value:?}"))?;
        if !score.is_finite() {
            return Err(anyhow!("champion score {value:?} is not finite"));
        }
        Ok(Self(Some(score)))
    }

    fn encode(&self) -> Result<String> {
        Ok(match self.0 {
            Some(score) => format!("{score}\n"),
            None => String::new(),
        })
    }
}

/// RFC 3339 timestamp of the first `run` against this state directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartTimestamp(pub Option<String>);

impl Document for StartTimestamp {
    const FILE: &'static str = "start_timestamp";

    fn decode(contents: &str) -> Result<Self> {
        let value = contents.trim();
        if value.is_empty() {
            return Ok(Self(None));
        }
        DateTime::parse_from_rfc3339(value)
            .with_context(|| format!("invalid start timestamp {value:?}"))?;
        Ok(Self(Some(value.to_string())))
    }

    fn encode(&self) -> Result<String> {
        Ok(match &self.0 {
            Some(ts) => format!("{ts}\n"),
            None => String::new(),
        })
    }
}

fn decode_json<T: for<'de> Deserialize<'de>>(contents: &str) -> Result<T> {
    Ok(serde_json::from_str(contents)?)
}

impl Document for Champion {
    const FILE: &'static str = "champion.json";

    fn decode(contents: &str) -> Result<Self> {
        decode_json(contents)
    }

    fn encode(&self) -> Result<String> {
        to_json_pretty(self)
    }
}

impl Document for Watermarks {
    const FILE: &'static str = "watermarks.json";

    fn decode(contents: &str) -> Result<Self> {
        decode_json(contents)
    }

    fn encode(&self) -> Result<String> {
        to_json_pretty(self)
    }
}

impl Document for PromotionLedger {
    const FILE: &'static str = "promotion_ledger.json";

    fn decode(contents: &str) -> Result<Self> {
        decode_json(contents)
    }

    fn encode(&self) -> Result<String> {
        to_json_pretty(self)
    }
}

impl Document for OpportunityBook {
    const FILE: &'static str = "opportunity_priors.json";

    fn decode(contents: &str) -> Result<Self> {
        decode_json(contents)
    }

    fn encode(&self) -> Result<String> {
        to_json_pretty(self)
    }
}

/// Execution-gate audit keyed by iteration id. Entries are write-once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateAudit {
    pub records: BTreeMap<IterationId, ExecutionGateRecord>,
}

impl GateAudit {
    /// Insert unless the iteration already has a record. Returns `true` on insert.
    pub fn insert_once(&mut self, iteration: IterationId, record: ExecutionGateRecord) -> bool {
        if self.records.contains_key(&iteration) {
            return false;
        }
        self.records.insert(iteration, record);
        true
    }
}

impl Document for GateAudit {
    const FILE: &'static str = "execution_gates.json";

    fn decode(contents: &str) -> Result<Self> {
        decode_json(contents)
    }

    fn encode(&self) -> Result<String> {
        to_json_pretty(self)
    }
}

/// Rate-limiter bookkeeping, one read-modify-write document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitState {
    /// Unix epoch milliseconds of the last generator call.
    pub last_call_at_ms: Option<i64>,
    pub calls: u64,
}

impl Document for RateLimitState {
    const FILE: &'static str = "rate_limit.json";

    fn decode(contents: &str) -> Result<Self> {
        decode_json(contents)
    }

    fn encode(&self) -> Result<String> {
        to_json_pretty(self)
    }
}

/// Append-only iteration log, one JSON object per line.
///
/// Lines that fail to parse are skipped with a warning so one damaged entry
/// cannot hide the rest of the history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationLog {
    pub records: Vec<IterationRecord>,
}

impl IterationLog {
    pub fn last_id(&self) -> Option<IterationId> {
        self.records.iter().map(|record| record.id).max()
    }

    pub fn contains(&self, id: IterationId) -> bool {
        self.records.iter().any(|record| record.id == id)
    }

    /// Append a terminal record unless one already exists for its id.
    pub fn append(&mut self, record: IterationRecord) -> bool {
        if self.contains(record.id) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// The most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> &[IterationRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }
}

impl Document for IterationLog {
    const FILE: &'static str = "iterations.jsonl";

    fn decode(contents: &str) -> Result<Self> {
        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IterationRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(line = idx + 1, err = %err, "skipping unparseable iteration log line"),
            }
        }
        Ok(Self { records })
    }

    fn encode(&self) -> Result<String> {
        let mut buf = String::new();
        for record in &self.records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{IterationError, IterationStatus, ErrorStage};

    fn record(id: IterationId) -> IterationRecord {
        IterationRecord {
            id,
            status: IterationStatus::Failed,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: None,
            duration_ms: None,
            opportunity_id: None,
            candidate_ref: None,
            result_ref: None,
            effective_score: None,
            promoted: false,
            error: Some(IterationError {
                stage: ErrorStage::GenerationFailed,
                message: "boom".to_string(),
            }),
        }
    }

    #[test]
    fn scalars_reject_garbage() {
        assert!(IterationCounter::decode("12x").is_err());
        assert_eq!(IterationCounter::decode("12\n").expect("decode"), IterationCounter(12));
        assert!(ChampionScore::decode("NaN").is_err());
        assert_eq!(ChampionScore::decode("").expect("decode"), ChampionScore(None));
        assert!(StartTimestamp::decode("yesterday").is_err());
    }

    #[test]
    fn champion_score_text_is_stable() {
        assert_eq!(ChampionScore(Some(485.0)).encode().expect("encode"), "485\n");
        assert_eq!(
            ChampionScore::decode("485.25\n").expect("decode"),
            ChampionScore(Some(485.25))
        );
    }

    #[test]
    fn iteration_log_skips_bad_lines_and_dedupes() {
        let mut log = IterationLog::default();
        assert!(log.append(record(1)));
        assert!(!log.append(record(1)));
        assert!(log.append(record(2)));
        let mut text = log.encode().expect("encode");
        text.push_str("{not json\n");
        let decoded = IterationLog::decode(&text).expect("decode");
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.last_id(), Some(2));
    }

    #[test]
    fn gate_audit_is_write_once_and_keyed_by_iteration() {
        let mut audit = GateAudit::default();
        let mut first = ExecutionGateRecord::default();
        first.early_abort.triggered = true;
        assert!(audit.insert_once(3, first.clone()));
        assert!(!audit.insert_once(3, ExecutionGateRecord::default()));
        assert_eq!(audit.records[&3], first);
        let json = audit.encode().expect("encode");
        assert!(json.starts_with("{\n  \"3\": {"));
        assert_eq!(GateAudit::decode(&json).expect("decode"), audit);
    }
}
