//! Indexed time series and the readers that produce them.
//!
//! Observations and simulated output both arrive as tables keyed by a
//! timestamp column. Missing cells (`""`, `NaN`, `NA`) become `f64::NAN` and
//! are skipped when errors are computed.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::{CalibError, Result};

const TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeries {
    index: Vec<NaiveDateTime>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl TimeSeries {
    pub fn new(index: Vec<NaiveDateTime>) -> Self {
        Self {
            index,
            columns: BTreeMap::new(),
        }
    }

    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.index.len() {
            return Err(CalibError::CardinalityMismatch(format!(
                "column {} has {} values for {} timestamps",
                name,
                values.len(),
                self.index.len()
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.insert_column(name, values)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        &self.index
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Keeps only `keys`, failing on the first one that is absent.
    pub fn select(&self, keys: &[String]) -> Result<TimeSeries> {
        let mut out = TimeSeries::new(self.index.clone());
        for key in keys {
            let values = self
                .columns
                .get(key)
                .ok_or_else(|| CalibError::MissingColumn(key.clone()))?;
            out.columns.insert(key.clone(), values.clone());
        }
        Ok(out)
    }

    /// Reorders rows by ascending timestamp. Stable for equal timestamps.
    pub fn sorted(mut self) -> TimeSeries {
        if self.index.windows(2).all(|w| w[0] <= w[1]) {
            return self;
        }
        let mut order: Vec<usize> = (0..self.index.len()).collect();
        order.sort_by_key(|&i| self.index[i]);
        self.index = order.iter().map(|&i| self.index[i]).collect();
        for values in self.columns.values_mut() {
            *values = order.iter().map(|&i| values[i]).collect();
        }
        self
    }

    /// Rows with `start <= t <= end`.
    pub fn window(&self, start: NaiveDateTime, end: NaiveDateTime) -> TimeSeries {
        let keep: Vec<usize> = self
            .index
            .iter()
            .enumerate()
            .filter(|(_, t)| **t >= start && **t <= end)
            .map(|(i, _)| i)
            .collect();
        TimeSeries {
            index: keep.iter().map(|&i| self.index[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), keep.iter().map(|&i| v[i]).collect()))
                .collect(),
        }
    }
}

/// Loads a time series for the requested columns from a file.
pub trait SeriesSource {
    fn load(&self, path: &Path, keys: &[String]) -> Result<TimeSeries>;
}

/// Delimited text with a header row and one timestamp column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSeriesReader {
    pub time_column: String,
    /// Explicit chrono format; when unset RFC 3339 and the common
    /// `YYYY-mm-dd[ HH:MM[:SS]]` shapes are tried in turn.
    pub time_format: Option<String>,
    pub delimiter: u8,
}

impl Default for CsvSeriesReader {
    fn default() -> Self {
        Self {
            time_column: "time".to_string(),
            time_format: None,
            delimiter: b',',
        }
    }
}

impl CsvSeriesReader {
    pub fn new(time_column: impl Into<String>) -> Self {
        Self {
            time_column: time_column.into(),
            ..Self::default()
        }
    }

    /// Reads every column when `keys` is empty.
    pub fn read(&self, path: &Path, keys: &[String]) -> Result<TimeSeries> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.clone();
        let time_idx = headers
            .iter()
            .position(|h| h == self.time_column)
            .ok_or_else(|| CalibError::MissingColumn(self.time_column.clone()))?;

        let wanted: Vec<(String, usize)> = if keys.is_empty() {
            headers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != time_idx)
                .map(|(i, h)| (h.to_string(), i))
                .collect()
        } else {
            keys.iter()
                .map(|k| {
                    headers
                        .iter()
                        .position(|h| h == k)
                        .map(|i| (k.clone(), i))
                        .ok_or_else(|| CalibError::MissingColumn(k.clone()))
                })
                .collect::<Result<_>>()?
        };

        let mut index = Vec::new();
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); wanted.len()];
        for record in reader.records() {
            let record = record?;
            let raw_time = record.get(time_idx).unwrap_or("");
            index.push(parse_timestamp(raw_time, self.time_format.as_deref())?);
            for (slot, (name, idx)) in values.iter_mut().zip(&wanted) {
                slot.push(parse_cell(record.get(*idx).unwrap_or(""), name)?);
            }
        }

        let mut series = TimeSeries::new(index);
        for ((name, _), column) in wanted.into_iter().zip(values) {
            series.insert_column(name, column)?;
        }
        let series = series.sorted();
        debug!(
            path = %path.display(),
            rows = series.len(),
            "loaded series"
        );
        Ok(series)
    }
}

impl SeriesSource for CsvSeriesReader {
    fn load(&self, path: &Path, keys: &[String]) -> Result<TimeSeries> {
        self.read(path, keys)
    }
}

pub fn parse_timestamp(raw: &str, format: Option<&str>) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
        return NaiveDate::parse_from_str(raw, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| CalibError::TimeParse(raw.to_string()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc());
    }
    for fmt in TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| CalibError::TimeParse(raw.to_string()))
}

fn parse_cell(raw: &str, column: &str) -> Result<f64> {
    match raw {
        "" | "NaN" | "nan" | "NA" => Ok(f64::NAN),
        _ => raw.parse::<f64>().map_err(|_| CalibError::NumberParse {
            column: column.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s, None).expect("timestamp")
    }

    #[test]
    fn timestamp_shapes() {
        let expected = NaiveDate::from_ymd_opt(2012, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .expect("date");
        assert_eq!(ts("2012-06-01 12:30:00"), expected);
        assert_eq!(ts("2012-06-01T12:30:00"), expected);
        assert_eq!(ts("2012-06-01 12:30"), expected);
        assert_eq!(ts("2012-06-01T12:30:00Z"), expected);
        assert_eq!(ts("2012-06-01").format("%H:%M").to_string(), "00:00");
        assert!(parse_timestamp("June first", None).is_err());
        assert_eq!(
            parse_timestamp("01/06/2012", Some("%d/%m/%Y")).expect("custom"),
            NaiveDate::from_ymd_opt(2012, 6, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .expect("date")
        );
    }

    #[test]
    fn reads_selected_columns_with_gaps() {
        let path = std::env::temp_dir().join(format!(
            "calib_series_{}_{}.csv",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::write(
            &path,
            "time,gpp,le\n2012-01-01 00:00,1.5,10\n2012-01-01 01:00,,11\n2012-01-01 02:00,NaN,12\n",
        )
        .expect("write");
        let reader = CsvSeriesReader::default();
        let series = reader.read(&path, &["gpp".to_string()]).expect("read");
        assert_eq!(series.len(), 3);
        let gpp = series.column("gpp").expect("gpp");
        assert_eq!(gpp[0], 1.5);
        assert!(gpp[1].is_nan() && gpp[2].is_nan());
        assert!(series.column("le").is_none());

        let err = reader.read(&path, &["nee".to_string()]).expect_err("missing");
        assert_eq!(err.code(), "missing_column");
        let all = reader.read(&path, &[]).expect("all");
        assert_eq!(all.column_names().collect::<Vec<_>>(), vec!["gpp", "le"]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn window_is_inclusive() {
        let series = TimeSeries::new(vec![ts("2012-01-01"), ts("2012-01-02"), ts("2012-01-03")])
            .with_column("x", vec![1.0, 2.0, 3.0])
            .expect("column");
        let w = series.window(ts("2012-01-02"), ts("2012-01-03"));
        assert_eq!(w.column("x"), Some(&[2.0, 3.0][..]));
        assert!(series.select(&["y".to_string()]).is_err());
    }

    #[test]
    fn sorted_reorders_every_column() {
        let series = TimeSeries::new(vec![ts("2012-01-03"), ts("2012-01-01"), ts("2012-01-02")])
            .with_column("x", vec![3.0, 1.0, 2.0])
            .expect("column")
            .sorted();
        assert_eq!(series.index()[0], ts("2012-01-01"));
        assert_eq!(series.column("x"), Some(&[1.0, 2.0, 3.0][..]));
    }
}
