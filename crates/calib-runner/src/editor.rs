use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CalibError, Result, StructureError};
use crate::namelist::Namelist;
use crate::soil::{self, SoilLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEdit {
    pub file: PathBuf,
    pub block: String,
    pub field: String,
    pub value: String,
}

impl FieldEdit {
    pub fn new(
        file: impl Into<PathBuf>,
        block: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            block: block.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditRequest {
    Single(FieldEdit),
    Batch(Vec<FieldEdit>),
}

/// How a batch reacts to a missing block/field.
///
/// `ShortCircuit` applies edits one file write at a time and stops at the
/// first failure, so earlier edits of the batch stay applied. `Validated`
/// applies the whole batch in memory first and writes nothing unless every
/// edit resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    ShortCircuit,
    Validated,
}

/// The first edit of a request whose location did not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedEdit {
    pub index: usize,
    pub error: StructureError,
}

fn try_set_field(edit: &FieldEdit) -> Result<std::result::Result<(), StructureError>> {
    let path = edit.file.as_path();
    let mut nml = Namelist::load(path)?;
    if let Err(e) = nml.set_field(&edit.block, &edit.field, &edit.value) {
        return Ok(Err(e));
    }
    nml.save(path)?;
    debug!(
        file = %path.display(),
        block = %edit.block,
        field = %edit.field,
        value = %edit.value,
        "field updated"
    );
    Ok(Ok(()))
}

/// Rewrites one field. `Ok(false)` when the block or field is absent; IO
/// failures are errors.
pub fn set_field(path: &Path, block: &str, field: &str, literal: &str) -> Result<bool> {
    let edit = FieldEdit::new(path, block, field, literal);
    match try_set_field(&edit)? {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(file = %path.display(), "{}", e);
            Ok(false)
        }
    }
}

/// Like [`set_field`] but keeps the field's current quote style.
pub fn set_string_field(path: &Path, block: &str, field: &str, raw: &str) -> Result<bool> {
    let mut nml = Namelist::load(path)?;
    match nml.set_string_field(block, field, raw) {
        Ok(()) => {
            nml.save(path)?;
            debug!(file = %path.display(), block, field, value = raw, "string field updated");
            Ok(true)
        }
        Err(e) => {
            warn!(file = %path.display(), "{}", e);
            Ok(false)
        }
    }
}

pub fn set_fields(edits: &[FieldEdit], mode: BatchMode) -> Result<bool> {
    Ok(apply_batch(edits, mode)?.is_none())
}

/// Applies a request. `Ok(None)` when every edit resolved, otherwise the
/// first edit that did not.
pub fn apply(request: &EditRequest, mode: BatchMode) -> Result<Option<UnresolvedEdit>> {
    match request {
        EditRequest::Single(edit) => match try_set_field(edit)? {
            Ok(()) => Ok(None),
            Err(error) => {
                warn!(file = %edit.file.display(), "{}", error);
                Ok(Some(UnresolvedEdit { index: 0, error }))
            }
        },
        EditRequest::Batch(edits) => apply_batch(edits, mode),
    }
}

fn apply_batch(edits: &[FieldEdit], mode: BatchMode) -> Result<Option<UnresolvedEdit>> {
    match mode {
        BatchMode::ShortCircuit => {
            for (index, edit) in edits.iter().enumerate() {
                if let Err(error) = try_set_field(edit)? {
                    warn!(file = %edit.file.display(), "{}", error);
                    return Ok(Some(UnresolvedEdit { index, error }));
                }
            }
            Ok(None)
        }
        BatchMode::Validated => {
            let mut staged: BTreeMap<&Path, Namelist> = BTreeMap::new();
            for (index, edit) in edits.iter().enumerate() {
                let path = edit.file.as_path();
                if !staged.contains_key(path) {
                    staged.insert(path, Namelist::load(path)?);
                }
                let Some(nml) = staged.get_mut(path) else {
                    continue;
                };
                if let Err(error) = nml.set_field(&edit.block, &edit.field, &edit.value) {
                    warn!(file = %path.display(), "{}; batch not applied", error);
                    return Ok(Some(UnresolvedEdit { index, error }));
                }
            }
            for (path, nml) in &staged {
                nml.save(path)?;
            }
            Ok(None)
        }
    }
}

/// Rewrites positional values of a soil ancillary record. The position of
/// each name comes from the companion namelist's declared name list.
pub fn set_soil_field(
    file: &Path,
    names: &[String],
    values: &[String],
    companion: &Path,
    layout: &SoilLayout,
) -> Result<bool> {
    if names.len() != values.len() {
        return Err(CalibError::CardinalityMismatch(format!(
            "{} soil names but {} values",
            names.len(),
            values.len()
        )));
    }
    if names.is_empty() {
        return Ok(true);
    }
    let declared = soil::read_field_names(companion, layout)?;
    let mut positions = Vec::with_capacity(names.len());
    for name in names {
        match declared.iter().position(|d| d == name) {
            Some(idx) => positions.push(idx),
            None => {
                warn!(
                    "soil variable {} not declared in {} {}/{}",
                    name,
                    companion.display(),
                    layout.block,
                    layout.names_field
                );
                return Ok(false);
            }
        }
    }
    let mut record = soil::read_values(file)?;
    if record.values.len() != declared.len() {
        return Err(CalibError::CardinalityMismatch(format!(
            "{} declares {} soil variables, {} holds {} values",
            companion.display(),
            declared.len(),
            file.display(),
            record.values.len()
        )));
    }
    for (idx, value) in positions.into_iter().zip(values) {
        record.values[idx] = value.clone();
    }
    soil::write_values(file, &record)?;
    debug!(file = %file.display(), count = names.len(), "soil values updated");
    Ok(true)
}
