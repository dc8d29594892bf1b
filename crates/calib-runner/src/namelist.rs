//! Line-oriented namelist files.
//!
//! A block opens at a line carrying its name (normally `&name`) and runs to
//! the first later line starting with `/` (its own terminator) or `&` (the
//! next block), or to end of file. Fields are `name=value[,]`; a value may
//! continue over following lines that carry no `=`.
//!
//! Lines are stored with their original terminators so that rendering an
//! unmodified [`Namelist`] reproduces the input byte for byte.

use std::ops::Range;
use std::path::Path;

use crate::error::{IoContext, Result, StructureError};
use crate::fsutil::atomic_write_bytes;

pub const DEFAULT_QUOTE: char = '\'';

const TERMINATORS: [char; 2] = ['/', '&'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namelist {
    lines: Vec<String>,
}

/// Where a field sits: `first` holds `name=`, `end` is one past its last
/// continuation line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSpan {
    first: usize,
    end: usize,
}

impl Namelist {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(path)?;
        Ok(Self::parse(&text))
    }

    /// Materializes the whole file before writing it in one atomic step.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.render().as_bytes())
    }

    pub fn render(&self) -> String {
        self.lines.concat()
    }

    pub fn read_block(&self, block: &str) -> std::result::Result<Vec<&str>, StructureError> {
        let range = self.block_range(block)?;
        Ok(self.lines[range].iter().map(|l| content(l)).collect())
    }

    pub fn read_field(
        &self,
        block: &str,
        field: &str,
    ) -> std::result::Result<String, StructureError> {
        let range = self.block_range(block)?;
        let span = self.field_span(&range, block, field)?;
        let first = content(&self.lines[span.first]);
        let mut value = first
            .split_once('=')
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();
        for line in &self.lines[span.first + 1..span.end] {
            if is_significant(line) {
                value.push_str(content(line).trim());
            }
        }
        if value.ends_with(',') {
            value.pop();
        }
        Ok(value)
    }

    /// Replaces the whole field (continuation lines included) with a single
    /// `name=literal` line. A comma follows unless the field is the last one
    /// before the block terminator.
    pub fn set_field(
        &mut self,
        block: &str,
        field: &str,
        literal: &str,
    ) -> std::result::Result<(), StructureError> {
        let range = self.block_range(block)?;
        let span = self.field_span(&range, block, field)?;

        let first = content(&self.lines[span.first]);
        let indent: String = first.chars().take_while(|c| c.is_whitespace()).collect();
        let name = first
            .split_once('=')
            .map(|(name, _)| name.trim().to_string())
            .unwrap_or_else(|| field.to_string());
        let terminator = line_terminator(&self.lines[span.end - 1]).to_string();
        let more_fields = self.lines[span.end..range.end]
            .iter()
            .any(|l| is_significant(l));
        let separator = if more_fields { "," } else { "" };

        let replacement = format!("{}{}={}{}{}", indent, name, literal, separator, terminator);
        self.lines
            .splice(span.first..span.end, std::iter::once(replacement));
        Ok(())
    }

    /// Sets a string-typed field, wrapping `raw` in the quote character the
    /// field currently uses.
    pub fn set_string_field(
        &mut self,
        block: &str,
        field: &str,
        raw: &str,
    ) -> std::result::Result<(), StructureError> {
        let current = self.read_field(block, field)?;
        let quote = quote_char(&current).unwrap_or(DEFAULT_QUOTE);
        let literal = format!("{}{}{}", quote, raw, quote);
        self.set_field(block, field, &literal)
    }

    /// Prefers an exact `&name` header; falls back to the first line that
    /// contains the name anywhere.
    fn block_range(&self, block: &str) -> std::result::Result<Range<usize>, StructureError> {
        let start = self
            .lines
            .iter()
            .position(|l| is_header_for(content(l), block))
            .or_else(|| self.lines.iter().position(|l| l.contains(block)))
            .ok_or_else(|| StructureError::BlockNotFound {
                block: block.to_string(),
            })?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|l| l.starts_with(&TERMINATORS[..]))
            .map(|off| start + 1 + off)
            .unwrap_or(self.lines.len());
        Ok(start..end)
    }

    fn field_span(
        &self,
        range: &Range<usize>,
        block: &str,
        field: &str,
    ) -> std::result::Result<FieldSpan, StructureError> {
        let first = (range.start + 1..range.end)
            .find(|&i| {
                leading_token(content(&self.lines[i]))
                    .is_some_and(|t| t.eq_ignore_ascii_case(field))
            })
            .ok_or_else(|| StructureError::FieldNotFound {
                block: block.to_string(),
                field: field.to_string(),
            })?;
        let mut end = first + 1;
        for i in first + 1..range.end {
            let line = &self.lines[i];
            if line.contains('=') {
                break;
            }
            if is_significant(line) {
                end = i + 1;
            }
        }
        Ok(FieldSpan { first, end })
    }
}

pub fn read_block(text: &str, block: &str) -> std::result::Result<Vec<String>, StructureError> {
    let nml = Namelist::parse(text);
    nml.read_block(block)
        .map(|lines| lines.into_iter().map(str::to_string).collect())
}

pub fn read_field(
    text: &str,
    block: &str,
    field: &str,
) -> std::result::Result<String, StructureError> {
    Namelist::parse(text).read_field(block, field)
}

/// File-level read. A missing block/field comes back as
/// `CalibError::Structure`, an unreadable file as `CalibError::Io`.
pub fn read_field_from_file(path: &Path, block: &str, field: &str) -> Result<String> {
    Ok(Namelist::load(path)?.read_field(block, field)?)
}

/// Removes one matching pair of surrounding quotes, if present.
pub fn strip_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    match quote_char(trimmed) {
        Some(q) if trimmed.len() >= 2 && trimmed.ends_with(q) => &trimmed[1..trimmed.len() - 1],
        _ => trimmed,
    }
}

/// Splits a comma-separated literal list into unquoted items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| strip_quotes(item).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub fn quote_char(value: &str) -> Option<char> {
    match value.trim_start().chars().next() {
        Some(c @ ('\'' | '"')) => Some(c),
        _ => None,
    }
}

fn content(line: &str) -> &str {
    line.trim_end_matches(&['\n', '\r'][..])
}

fn line_terminator(line: &str) -> &str {
    &line[content(line).len()..]
}

fn is_significant(line: &str) -> bool {
    let body = content(line).trim();
    !body.is_empty() && !body.starts_with('!')
}

fn is_header_for(line: &str, block: &str) -> bool {
    line.trim_start()
        .strip_prefix('&')
        .and_then(|rest| rest.split_whitespace().next())
        .is_some_and(|name| name.eq_ignore_ascii_case(block))
}

fn leading_token(line: &str) -> Option<&str> {
    let body = line.trim_start();
    if body.starts_with(&TERMINATORS[..]) || body.starts_with('!') {
        return None;
    }
    body.split_once('=').map(|(name, _)| name.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT_NML: &str = "&jules_output\noutput_dir='./output',\nrun_id='',\n/\n&jules_output_profile\nprofile_name='daily',\nvar='gpp','npp',\n'smc_avail_tot',\n/\n";

    #[test]
    fn read_block_stops_at_terminator() {
        let lines = read_block(OUTPUT_NML, "jules_output").expect("block");
        assert_eq!(lines, vec!["&jules_output", "output_dir='./output',", "run_id='',"]);
    }

    #[test]
    fn exact_header_wins_over_substring() {
        let text = "&jules_output_profile\nprofile_name='a',\n/\n&jules_output\nrun_id='x',\n/\n";
        let nml = Namelist::parse(text);
        assert_eq!(nml.read_field("jules_output", "run_id").expect("field"), "'x'");
        assert!(nml.read_field("jules_output", "profile_name").is_err());
    }

    #[test]
    fn block_runs_to_end_of_file_without_terminator() {
        let text = "&blk\na=1,\nb=2";
        let lines = read_block(text, "blk").expect("block");
        assert_eq!(lines.len(), 3);
        assert_eq!(read_field(text, "blk", "b").expect("b"), "2");
    }

    #[test]
    fn missing_block_and_field_are_reported() {
        assert_eq!(
            read_field(OUTPUT_NML, "nope", "x"),
            Err(StructureError::BlockNotFound {
                block: "nope".to_string()
            })
        );
        assert_eq!(
            read_field(OUTPUT_NML, "jules_output", "missing"),
            Err(StructureError::FieldNotFound {
                block: "jules_output".to_string(),
                field: "missing".to_string()
            })
        );
    }

    #[test]
    fn read_field_joins_continuation_lines() {
        let zero = "&b\nv='a','b',\nn=1,\n/\n";
        let one = "&b\nv='a',\n'b',\nn=1,\n/\n";
        let two = "&b\nv='a',\n  'b',\n  'c',\nn=1,\n/\n";
        assert_eq!(read_field(zero, "b", "v").expect("zero"), "'a','b'");
        assert_eq!(read_field(one, "b", "v").expect("one"), "'a','b'");
        assert_eq!(read_field(two, "b", "v").expect("two"), "'a','b','c'");
    }

    #[test]
    fn field_match_uses_leading_token() {
        let text = "&b\nrun_id_suffix=1,\nrun_id='r',\n/\n";
        assert_eq!(read_field(text, "b", "run_id").expect("field"), "'r'");
    }

    #[test]
    fn set_then_read_round_trips() {
        let mut nml = Namelist::parse(OUTPUT_NML);
        nml.set_field("jules_output", "run_id", "'test_0'").expect("set");
        assert_eq!(nml.read_field("jules_output", "run_id").expect("read"), "'test_0'");
        nml.set_field("jules_output_profile", "profile_name", "'monthly'")
            .expect("set profile");
        assert_eq!(
            nml.read_field("jules_output_profile", "profile_name").expect("read"),
            "'monthly'"
        );
    }

    #[test]
    fn set_field_picks_separator_from_position() {
        let mut nml = Namelist::parse("&b\nx=1,\ny=2\n/\n");
        nml.set_field("b", "x", "5").expect("x");
        nml.set_field("b", "y", "6").expect("y");
        assert_eq!(nml.render(), "&b\nx=5,\ny=6\n/\n");
    }

    #[test]
    fn set_field_replaces_continuation_lines() {
        let mut nml = Namelist::parse("&b\nv='a',\n'b',\nn=1,\n/\n");
        nml.set_field("b", "v", "'z'").expect("set");
        assert_eq!(nml.render(), "&b\nv='z',\nn=1,\n/\n");
    }

    #[test]
    fn set_field_preserves_crlf_and_indent() {
        let mut nml = Namelist::parse("&b\r\n  x=1,\r\n  y=2\r\n/\r\n");
        nml.set_field("b", "x", "3").expect("set");
        assert_eq!(nml.render(), "&b\r\n  x=3,\r\n  y=2\r\n/\r\n");
    }

    #[test]
    fn untouched_namelist_renders_identically() {
        let nml = Namelist::parse(OUTPUT_NML);
        assert_eq!(nml.render(), OUTPUT_NML);
    }

    #[test]
    fn set_string_field_keeps_quote_style() {
        let mut nml = Namelist::parse("&b\na=\"x\",\nb='y',\nc=1\n/\n");
        nml.set_string_field("b", "a", "new").expect("a");
        nml.set_string_field("b", "b", "new").expect("b");
        nml.set_string_field("b", "c", "new").expect("c");
        assert_eq!(nml.read_field("b", "a").expect("a"), "\"new\"");
        assert_eq!(nml.read_field("b", "b").expect("b"), "'new'");
        assert_eq!(nml.read_field("b", "c").expect("c"), "'new'");
    }

    #[test]
    fn list_helpers_strip_quotes() {
        assert_eq!(strip_quotes(" 'daily' "), "daily");
        assert_eq!(strip_quotes("\"x\""), "x");
        assert_eq!(strip_quotes("plain"), "plain");
        assert_eq!(split_list("'b','sathh', 'satcon'"), vec!["b", "sathh", "satcon"]);
    }
}
