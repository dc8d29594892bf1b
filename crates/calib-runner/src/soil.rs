//! Single-line positional soil ancillary files (`'v1 v2 v3 ...'`). The name
//! of each position is declared in the companion namelist.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CalibError, IoContext, Result};
use crate::fsutil::atomic_write_bytes;
use crate::namelist::{self, Namelist};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoilLayout {
    /// Companion namelist file, relative to the namelist directory.
    pub companion_file: String,
    pub block: String,
    pub names_field: String,
    /// Field pointing at the ancillary data file.
    pub file_field: String,
}

impl Default for SoilLayout {
    fn default() -> Self {
        Self {
            companion_file: "ancillaries.nml".to_string(),
            block: "jules_soil_props".to_string(),
            names_field: "var".to_string(),
            file_field: "file".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncillaryRecord {
    /// Quote character wrapping the line, kept for the rewrite.
    pub quote: Option<char>,
    pub values: Vec<String>,
}

impl AncillaryRecord {
    pub fn render(&self) -> String {
        let body = self.values.join(" ");
        match self.quote {
            Some(q) => format!("{}{}{}", q, body, q),
            None => body,
        }
    }
}

pub fn read_field_names(companion: &Path, layout: &SoilLayout) -> Result<Vec<String>> {
    let raw = namelist::read_field_from_file(companion, &layout.block, &layout.names_field)?;
    Ok(namelist::split_list(&raw))
}

pub fn parse_values(text: &str, path: &Path) -> Result<AncillaryRecord> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let line = match lines.as_slice() {
        [line] => line.trim(),
        [] => {
            return Err(CalibError::MalformedAncillaryFile {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            })
        }
        more => {
            return Err(CalibError::MalformedAncillaryFile {
                path: path.to_path_buf(),
                reason: format!("expected one line, found {}", more.len()),
            })
        }
    };
    let quote = namelist::quote_char(line);
    let mut body = line;
    if let Some(q) = quote {
        body = body.strip_prefix(q).unwrap_or(body);
        body = body.strip_suffix(q).unwrap_or(body);
    }
    Ok(AncillaryRecord {
        quote,
        values: body.split_whitespace().map(str::to_string).collect(),
    })
}

pub fn read_values(path: &Path) -> Result<AncillaryRecord> {
    let text = std::fs::read_to_string(path).at(path)?;
    parse_values(&text, path)
}

/// Overwrites the file with the values joined by single spaces.
pub fn write_values(path: &Path, record: &AncillaryRecord) -> Result<()> {
    atomic_write_bytes(path, record.render().as_bytes())
}

/// Reads the data file path declared in the companion namelist.
pub fn declared_data_file(companion: &Path, layout: &SoilLayout) -> Result<String> {
    let nml = Namelist::load(companion)?;
    let raw = nml.read_field(&layout.block, &layout.file_field)?;
    Ok(namelist::strip_quotes(&raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_strips_wrapping_quote() {
        let rec = parse_values("'0.1 0.2  0.3'\n", Path::new("soil.dat")).expect("parse");
        assert_eq!(rec.quote, Some('\''));
        assert_eq!(rec.values, vec!["0.1", "0.2", "0.3"]);
        assert_eq!(rec.render(), "'0.1 0.2 0.3'");
    }

    #[test]
    fn parse_accepts_unquoted_line() {
        let rec = parse_values("1 2 3", Path::new("soil.dat")).expect("parse");
        assert_eq!(rec.quote, None);
        assert_eq!(rec.render(), "1 2 3");
    }

    #[test]
    fn parse_rejects_multiple_lines() {
        let err = parse_values("1 2\n3 4\n", &PathBuf::from("soil.dat")).expect_err("two lines");
        assert_eq!(err.code(), "malformed_ancillary_file");
        let err = parse_values("\n", &PathBuf::from("soil.dat")).expect_err("empty");
        assert_eq!(err.code(), "malformed_ancillary_file");
    }
}
