use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{CalibError, Result};

pub const LEDGER_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One iteration's identity and the literal values it ran with. Built before
/// the run starts and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDescriptor {
    pub run_id: String,
    pub timestamp: DateTime<Local>,
    pub parameter_values: Vec<(String, String)>,
}

impl RunDescriptor {
    pub fn new(run_id: impl Into<String>, parameter_values: Vec<(String, String)>) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Local::now(),
            parameter_values,
        }
    }

    pub fn ledger_cells(&self) -> Vec<String> {
        let mut cells = Vec::with_capacity(self.parameter_values.len() + 2);
        cells.push(self.run_id.clone());
        cells.push(self.timestamp.format(LEDGER_DATE_FORMAT).to_string());
        cells.extend(self.parameter_values.iter().map(|(_, v)| v.clone()));
        cells
    }
}

/// How run identifiers are assigned. Identifiers double as output file
/// basenames, so one orchestration sticks to one scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum RunIdScheme {
    /// `<prefix>_0`, `<prefix>_1`, ...
    Counter { prefix: String },
    /// `<prefix>_<YYYYmmdd_HHMMSS>`, with a counter suffix on collisions.
    Timestamp { prefix: String },
    /// Caller-supplied identifiers, one per iteration.
    Explicit { ids: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct RunIdGenerator {
    scheme: RunIdScheme,
    next: usize,
    last: Option<String>,
}

impl RunIdGenerator {
    pub fn new(scheme: RunIdScheme) -> Self {
        Self {
            scheme,
            next: 0,
            last: None,
        }
    }

    pub fn next_id(&mut self) -> Result<String> {
        let idx = self.next;
        let id = match &self.scheme {
            RunIdScheme::Counter { prefix } => format!("{}_{}", prefix, idx),
            RunIdScheme::Timestamp { prefix } => {
                let stamp = format!("{}_{}", prefix, Local::now().format("%Y%m%d_%H%M%S"));
                match &self.last {
                    Some(last) if last.starts_with(&stamp) => format!("{}_{}", stamp, idx),
                    _ => stamp,
                }
            }
            RunIdScheme::Explicit { ids } => ids.get(idx).cloned().ok_or_else(|| {
                CalibError::CardinalityMismatch(format!(
                    "explicit run id list has {} entries, iteration {} needs one more",
                    ids.len(),
                    idx
                ))
            })?,
        };
        self.next += 1;
        self.last = Some(id.clone());
        Ok(id)
    }
}

/// Derives the successor of a counter-suffixed id: `opt_4` -> `opt_5`.
/// Ids without a numeric suffix get `_1` appended.
pub fn next_run_id(previous: &str) -> String {
    match previous.rsplit_once('_') {
        Some((stem, suffix)) => match suffix.parse::<u64>() {
            Ok(n) => format!("{}_{}", stem, n + 1),
            Err(_) => format!("{}_1", previous),
        },
        None => format!("{}_1", previous),
    }
}
