use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CalibError>;

/// Block or field lookup failures. Recoverable: edit operations surface
/// these as `Ok(false)` and leave the decision to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("block not found: {block}")]
    BlockNotFound { block: String },

    #[error("field not found: {block}/{field}")]
    FieldNotFound { block: String, field: String },
}

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error("required edit failed: {file}: {block}/{field}")]
    RequiredEditFailed {
        file: String,
        block: String,
        field: String,
    },

    #[error("ledger header mismatch in {}: expected [{}], found [{}]", path.display(), expected.join(","), found.join(","))]
    LedgerHeaderMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("ledger already exists (enable append to reuse it): {}", path.display())]
    LedgerExists { path: PathBuf },

    #[error("ledger row for {run_id} has {got} cells, header has {expected}")]
    LedgerRowWidth {
        run_id: String,
        expected: usize,
        got: usize,
    },

    #[error("simulation did not produce expected output: {}", path.display())]
    OutputFileMissing { path: PathBuf },

    #[error("no overlapping time index between observed and simulated series{}", variable.as_deref().map(|v| format!(" (variable {})", v)).unwrap_or_default())]
    NoOverlap { variable: Option<String> },

    #[error("malformed ancillary file {}: {reason}", path.display())]
    MalformedAncillaryFile { path: PathBuf, reason: String },

    #[error("cardinality mismatch: {0}")]
    CardinalityMismatch(String),

    #[error("workspace directory already contains files (enable overwrite to replace them): {}", path.display())]
    WorkspaceNotEmpty { path: PathBuf },

    #[error("output variable {key} is not declared in {block}/{field}")]
    UndeclaredOutputVariable {
        key: String,
        block: String,
        field: String,
    },

    #[error("series column not found: {0}")]
    MissingColumn(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid orchestrator state: {operation} not allowed in {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("failed to launch simulation {}: {source}", executable.display())]
    SimulationLaunch {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse timestamp '{0}'")]
    TimeParse(String),

    #[error("cannot parse number '{value}' in column {column}")]
    NumberParse { column: String, value: String },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl CalibError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CalibError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable code, used by the CLI's JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CalibError::Io { .. } => "io_error",
            CalibError::Structure(StructureError::BlockNotFound { .. }) => "block_not_found",
            CalibError::Structure(StructureError::FieldNotFound { .. }) => "field_not_found",
            CalibError::RequiredEditFailed { .. } => "required_edit_failed",
            CalibError::LedgerHeaderMismatch { .. } => "ledger_header_mismatch",
            CalibError::LedgerExists { .. } => "ledger_exists",
            CalibError::LedgerRowWidth { .. } => "ledger_row_width",
            CalibError::OutputFileMissing { .. } => "output_file_missing",
            CalibError::NoOverlap { .. } => "no_overlap",
            CalibError::MalformedAncillaryFile { .. } => "malformed_ancillary_file",
            CalibError::CardinalityMismatch(_) => "cardinality_mismatch",
            CalibError::WorkspaceNotEmpty { .. } => "workspace_not_empty",
            CalibError::UndeclaredOutputVariable { .. } => "undeclared_output_variable",
            CalibError::MissingColumn(_) => "missing_column",
            CalibError::InvalidPlan(_) => "invalid_plan",
            CalibError::InvalidState { .. } => "invalid_state",
            CalibError::SimulationLaunch { .. } => "simulation_launch",
            CalibError::TimeParse(_) => "time_parse",
            CalibError::NumberParse { .. } => "number_parse",
            CalibError::Csv(_) => "csv_error",
            CalibError::Yaml(_) => "yaml_error",
            CalibError::Json(_) => "json_error",
            CalibError::Walk(_) => "walk_error",
        }
    }
}

pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| CalibError::io(path, e))
    }
}
