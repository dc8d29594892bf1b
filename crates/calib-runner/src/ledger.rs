//! Append-only run ledger (`run_id,run_date,<params...>[,<metrics...>]`).
//!
//! The file is opened, appended and closed for every write; nothing holds it
//! open across a simulation. A row is written in up to two segments: the
//! descriptor cells before the run, the metric cells after it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CalibError, IoContext, Result};
use crate::fsutil::ensure_dir;
use crate::runs::RunDescriptor;

pub const RUN_ID_COLUMN: &str = "run_id";
pub const RUN_DATE_COLUMN: &str = "run_date";

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    header: Vec<String>,
    trailing: usize,
}

impl Ledger {
    pub fn header_for(params: &[String], trailing: &[String]) -> Vec<String> {
        let mut header = vec![RUN_ID_COLUMN.to_string(), RUN_DATE_COLUMN.to_string()];
        header.extend(params.iter().cloned());
        header.extend(trailing.iter().cloned());
        header
    }

    /// Creates the ledger, or validates an existing one when `append` is set.
    /// An existing ledger without `append`, or with a different header, is
    /// rejected before anything runs.
    pub fn open(path: &Path, params: &[String], trailing: &[String], append: bool) -> Result<Self> {
        let header = Self::header_for(params, trailing);
        let ledger = Self {
            path: path.to_path_buf(),
            header,
            trailing: trailing.len(),
        };
        let existing = path.exists() && fs::metadata(path).at(path)?.len() > 0;
        if existing {
            let found = read_header(path)?;
            // A header-only ledger with our header carries no rows to protect.
            let header_only = found == ledger.header && read_rows(path)?.is_empty();
            if !append && !header_only {
                return Err(CalibError::LedgerExists {
                    path: path.to_path_buf(),
                });
            }
            if found != ledger.header {
                return Err(CalibError::LedgerHeaderMismatch {
                    path: path.to_path_buf(),
                    expected: ledger.header.clone(),
                    found,
                });
            }
            ledger.repair_dangling_row()?;
            debug!(ledger = %path.display(), "appending to existing ledger");
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    ensure_dir(parent)?;
                }
            }
            let line = format!("{}\n", encode_cells(&ledger.header)?);
            fs::write(path, line).at(path)?;
            debug!(ledger = %path.display(), "created ledger");
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Writes the descriptor cells. With no metric columns the row is
    /// complete; otherwise the returned [`PendingRow`] must be finished.
    pub fn record(&self, descriptor: &RunDescriptor) -> Result<PendingRow> {
        let cells = descriptor.ledger_cells();
        let expected = self.header.len() - self.trailing;
        if cells.len() != expected {
            return Err(CalibError::LedgerRowWidth {
                run_id: descriptor.run_id.clone(),
                expected,
                got: cells.len(),
            });
        }
        let mut segment = encode_cells(&cells)?;
        if self.trailing == 0 {
            segment.push('\n');
        }
        append_text(&self.path, &segment)?;
        Ok(PendingRow {
            path: self.path.clone(),
            run_id: descriptor.run_id.clone(),
            remaining: self.trailing,
            done: self.trailing == 0,
        })
    }

    fn repair_dangling_row(&self) -> Result<()> {
        let bytes = fs::read(&self.path).at(&self.path)?;
        if bytes.last().map_or(true, |b| *b == b'\n') {
            return Ok(());
        }
        let tail_start = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(&bytes[tail_start..]);
        let present = match reader.records().next() {
            Some(record) => record?.len(),
            None => 0,
        };
        let pad = self.header.len().saturating_sub(present);
        warn!(
            ledger = %self.path.display(),
            missing_cells = pad,
            "closing unterminated ledger row"
        );
        append_text(&self.path, &format!("{}\n", ",".repeat(pad)))
    }
}

/// The open tail of a ledger row. Dropping it unfinished closes the row
/// with blank metric cells so the file stays rectangular.
#[derive(Debug)]
pub struct PendingRow {
    path: PathBuf,
    run_id: String,
    remaining: usize,
    done: bool,
}

impl PendingRow {
    pub fn is_open(&self) -> bool {
        !self.done
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn finish(mut self, cells: &[String]) -> Result<()> {
        if self.done {
            return if cells.is_empty() {
                Ok(())
            } else {
                Err(CalibError::LedgerRowWidth {
                    run_id: self.run_id.clone(),
                    expected: 0,
                    got: cells.len(),
                })
            };
        }
        if cells.len() != self.remaining {
            return Err(CalibError::LedgerRowWidth {
                run_id: self.run_id.clone(),
                expected: self.remaining,
                got: cells.len(),
            });
        }
        append_text(&self.path, &format!(",{}\n", encode_cells(cells)?))?;
        self.done = true;
        Ok(())
    }

    fn close_blank(&mut self) -> Result<()> {
        append_text(&self.path, &format!("{}\n", ",".repeat(self.remaining)))?;
        self.done = true;
        Ok(())
    }
}

impl Drop for PendingRow {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.close_blank() {
                warn!(run_id = %self.run_id, "failed to close ledger row: {}", e);
            }
        }
    }
}

pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    match reader.records().next() {
        Some(record) => Ok(record?.iter().map(str::to_string).collect()),
        None => Ok(Vec::new()),
    }
}

/// All rows below the header, as raw cells.
pub fn read_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn encode_cells(cells: &[String]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(cells)?;
    let bytes = writer.into_inner().map_err(|e| {
        CalibError::Csv(csv::Error::from(std::io::Error::new(
            e.error().kind(),
            e.error().to_string(),
        )))
    })?;
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

fn append_text(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path).at(path)?;
    file.write_all(text.as_bytes()).at(path)?;
    file.flush().at(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "calib_ledger_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn creates_header_and_appends_complete_rows() {
        let root = scratch("create");
        let path = root.join("run_info.csv");
        let ledger = Ledger::open(&path, &names(&["albedo"]), &[], false).expect("open");
        let row = ledger
            .record(&RunDescriptor::new("test_0", vec![("albedo".into(), "0.1".into())]))
            .expect("record");
        assert!(!row.is_open());
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("run_id,run_date,albedo\ntest_0,"));
        assert!(text.ends_with(",0.1\n"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn existing_ledger_requires_append_and_matching_header() {
        let root = scratch("header");
        let path = root.join("run_info.csv");
        let ledger = Ledger::open(&path, &names(&["albedo"]), &[], false).expect("create");
        Ledger::open(&path, &names(&["albedo"]), &[], false).expect("header-only reuse");
        ledger
            .record(&RunDescriptor::new("t_0", vec![("albedo".into(), "0.1".into())]))
            .expect("record");

        let err = Ledger::open(&path, &names(&["albedo"]), &[], false).expect_err("exists");
        assert_eq!(err.code(), "ledger_exists");
        let err = Ledger::open(&path, &names(&["albedo", "lai"]), &[], true).expect_err("mismatch");
        assert_eq!(err.code(), "ledger_header_mismatch");
        Ledger::open(&path, &names(&["albedo"]), &[], true).expect("append");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pending_row_takes_metric_segment() {
        let root = scratch("pending");
        let path = root.join("opt_run_info.csv");
        let ledger = Ledger::open(&path, &names(&["x"]), &names(&["rmse", "run_time"]), false)
            .expect("open");
        let row = ledger
            .record(&RunDescriptor::new("opt_1", vec![("x".into(), "0.5".into())]))
            .expect("record");
        assert!(row.is_open());
        row.finish(&names(&["0.25", "1.5"])).expect("finish");
        let rows = read_rows(&path).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 5);
        assert_eq!(rows[0][3], "0.25");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dropped_row_is_closed_with_blanks() {
        let root = scratch("drop");
        let path = root.join("opt_run_info.csv");
        let ledger = Ledger::open(&path, &names(&["x"]), &names(&["rmse"]), false).expect("open");
        {
            let _row = ledger
                .record(&RunDescriptor::new("opt_1", vec![("x".into(), "0.5".into())]))
                .expect("record");
        }
        let rows = read_rows(&path).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 4);
        assert_eq!(rows[0][3], "");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn append_repairs_unterminated_row() {
        let root = scratch("repair");
        let path = root.join("run_info.csv");
        fs::write(&path, "run_id,run_date,x,rmse\nopt_1,2024-01-01 00:00:00,0.5").expect("seed");
        let ledger = Ledger::open(&path, &names(&["x"]), &names(&["rmse"]), true).expect("open");
        let row = ledger
            .record(&RunDescriptor::new("opt_2", vec![("x".into(), "0.6".into())]))
            .expect("record");
        row.finish(&names(&["0.1"])).expect("finish");
        let rows = read_rows(&path).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], names(&["opt_1", "2024-01-01 00:00:00", "0.5", ""]));
        assert_eq!(rows[1][0], "opt_2");
        let _ = fs::remove_dir_all(root);
    }
}
