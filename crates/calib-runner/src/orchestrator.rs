use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::editor::{self, BatchMode, EditRequest, FieldEdit};
use crate::error::{CalibError, IoContext, Result};
use crate::fsutil::{atomic_write_bytes, ensure_dir, move_file, purge_dir_contents};
use crate::layout::SimulationLayout;
use crate::ledger::{Ledger, PendingRow};
use crate::namelist;
use crate::runs::{RunDescriptor, RunIdGenerator, RunIdScheme};
use crate::simulator::{Invocation, SimulationStatus, Simulator};
use crate::workspace::{self, Workspace, WorkspaceGuard};

pub const DEFAULT_LEDGER_NAME: &str = "run_info.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Staged,
    Running,
    Collected,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Staged => "staged",
            RunState::Running => "running",
            RunState::Collected => "collected",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

/// A namelist field the controller writes each iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTarget {
    /// Namelist file, relative to the configuration tree root.
    pub file: String,
    pub block: String,
    pub field: String,
    /// Writes the value as `N*value`, filling N equal entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
}

impl ParameterTarget {
    pub fn new(file: impl Into<String>, block: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            block: block.into(),
            field: field.into(),
            repeat: None,
        }
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn format_value(&self, raw: &str) -> String {
        match self.repeat {
            Some(n) => format!("{}*{}", n, raw),
            None => raw.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub master_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub output_folder: PathBuf,
    pub ledger_name: String,
    pub overwrite_workspace: bool,
    pub append_to_ledger: bool,
    pub keep_dump_files: bool,
    pub soil_ancillary: Option<PathBuf>,
    pub batch_mode: BatchMode,
    pub layout: SimulationLayout,
    /// Written to the output folder as `resolved_plan.json` + digest.
    pub resolved_plan: Option<Value>,
}

impl OrchestratorConfig {
    pub fn new(
        master_dir: impl Into<PathBuf>,
        workspace_dir: impl Into<PathBuf>,
        output_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            master_dir: master_dir.into(),
            workspace_dir: workspace_dir.into(),
            output_folder: output_folder.into(),
            ledger_name: DEFAULT_LEDGER_NAME.to_string(),
            overwrite_workspace: false,
            append_to_ledger: false,
            keep_dump_files: false,
            soil_ancillary: None,
            batch_mode: BatchMode::default(),
            layout: SimulationLayout::default(),
            resolved_plan: None,
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.output_folder.join(&self.ledger_name)
    }
}

/// Values for one iteration, aligned with the orchestrator's targets and
/// soil names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration {
    pub run_id: String,
    pub namelist_values: Vec<String>,
    pub soil_values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub output_path: PathBuf,
    pub dump_dir: Option<PathBuf>,
    pub status: SimulationStatus,
    pub duration: Duration,
}

/// A finished iteration whose ledger row may still be waiting for metrics.
#[derive(Debug)]
pub struct CollectedRun {
    pub descriptor: RunDescriptor,
    pub record: RunRecord,
    pub row: PendingRow,
}

/// Sequences edits, runs and collection against one staged workspace.
///
/// [`Orchestrator::new`] opens the ledger and starts in `Init`;
/// [`Orchestrator::stage`] builds the workspace and moves to `Staged`;
/// every successful [`Orchestrator::run`] ends in `Collected`;
/// [`Orchestrator::finish`] is `Done`. Any failure moves to `Failed` and the
/// workspace is removed when the orchestrator goes away.
pub struct Orchestrator<S: Simulator> {
    simulator: S,
    config: OrchestratorConfig,
    targets: Vec<ParameterTarget>,
    soil_names: Vec<String>,
    staged: Option<Staging>,
    ledger: Ledger,
    state: RunState,
}

struct Staging {
    guard: WorkspaceGuard,
    profile_name: String,
}

impl<S: Simulator> Orchestrator<S> {
    /// Validates the plan and opens the ledger. Nothing is staged yet.
    pub fn new(
        config: OrchestratorConfig,
        targets: Vec<ParameterTarget>,
        soil_names: Vec<String>,
        metric_columns: &[String],
        simulator: S,
    ) -> Result<Self> {
        if !soil_names.is_empty() && config.soil_ancillary.is_none() {
            return Err(CalibError::InvalidPlan(
                "soil parameters need a soil ancillary file".to_string(),
            ));
        }
        let mut columns: Vec<String> = targets.iter().map(|t| t.field.clone()).collect();
        columns.extend(soil_names.iter().cloned());
        let ledger = Ledger::open(
            &config.ledger_path(),
            &columns,
            metric_columns,
            config.append_to_ledger,
        )?;
        if let Some(plan) = &config.resolved_plan {
            write_resolved_plan(&config.output_folder, plan)?;
        }
        Ok(Self {
            simulator,
            config,
            targets,
            soil_names,
            staged: None,
            ledger,
            state: RunState::Init,
        })
    }

    /// [`Orchestrator::new`] followed by [`Orchestrator::stage`].
    pub fn init(
        config: OrchestratorConfig,
        targets: Vec<ParameterTarget>,
        soil_names: Vec<String>,
        metric_columns: &[String],
        simulator: S,
    ) -> Result<Self> {
        let mut orchestrator = Self::new(config, targets, soil_names, metric_columns, simulator)?;
        orchestrator.stage()?;
        Ok(orchestrator)
    }

    /// Copies the master namelists (and the soil ancillary) into the
    /// workspace and points the model's output at the workspace sink.
    pub fn stage(&mut self) -> Result<()> {
        if self.state != RunState::Init {
            return Err(CalibError::InvalidState {
                operation: "stage",
                state: self.state.as_str(),
            });
        }
        match stage_workspace(&self.config) {
            Ok(staged) => {
                info!(
                    workspace = %staged.guard.workspace().root.display(),
                    ledger = %self.ledger.path().display(),
                    profile = %staged.profile_name,
                    "orchestration staged"
                );
                self.staged = Some(staged);
                self.state = RunState::Staged;
                Ok(())
            }
            Err(e) => {
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.staged.as_ref().map(|s| s.profile_name.as_str())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn targets(&self) -> &[ParameterTarget] {
        &self.targets
    }

    pub fn staged_file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.workspace("staged_file")?.config_file(name))
    }

    fn workspace(&self, operation: &'static str) -> Result<&Workspace> {
        staged_workspace(&self.staged, operation, self.state)
    }

    /// Applies the iteration's edits, records it in the ledger, runs the
    /// simulation and relocates its output.
    pub fn run(&mut self, iteration: &Iteration) -> Result<CollectedRun> {
        if !matches!(self.state, RunState::Staged | RunState::Collected) {
            return Err(CalibError::InvalidState {
                operation: "run",
                state: self.state.as_str(),
            });
        }
        match self.run_inner(iteration) {
            Ok(collected) => {
                self.state = RunState::Collected;
                Ok(collected)
            }
            Err(e) => {
                self.state = RunState::Failed;
                error!(run_id = %iteration.run_id, "iteration failed: {}", e);
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, iteration: &Iteration) -> Result<CollectedRun> {
        if iteration.namelist_values.len() != self.targets.len()
            || iteration.soil_values.len() != self.soil_names.len()
        {
            return Err(CalibError::CardinalityMismatch(format!(
                "iteration {} carries {}+{} values for {}+{} parameters",
                iteration.run_id,
                iteration.namelist_values.len(),
                iteration.soil_values.len(),
                self.targets.len(),
                self.soil_names.len()
            )));
        }
        self.apply_edits(iteration)?;

        let mut parameter_values: Vec<(String, String)> = self
            .targets
            .iter()
            .zip(&iteration.namelist_values)
            .map(|(t, v)| (t.field.clone(), v.clone()))
            .collect();
        parameter_values.extend(
            self.soil_names
                .iter()
                .cloned()
                .zip(iteration.soil_values.iter().cloned()),
        );
        let descriptor = RunDescriptor::new(iteration.run_id.clone(), parameter_values);
        let row = self.ledger.record(&descriptor)?;

        self.state = RunState::Running;
        let ws = staged_workspace(&self.staged, "run", self.state)?;
        info!(run_id = %descriptor.run_id, "running simulation");
        let started = Instant::now();
        let status = self.simulator.run(&Invocation {
            working_dir: &ws.namelist_dir,
            output_dir: &ws.output_dir,
            run_id: &descriptor.run_id,
        })?;
        let duration = started.elapsed();
        if !status.is_success() {
            warn!(
                run_id = %descriptor.run_id,
                exit = %status.describe(),
                "simulation exited unsuccessfully"
            );
        }

        let (output_path, dump_dir) = self.collect(&descriptor.run_id)?;
        info!(
            run_id = %descriptor.run_id,
            output = %output_path.display(),
            seconds = duration.as_secs_f64(),
            "run collected"
        );
        Ok(CollectedRun {
            record: RunRecord {
                run_id: descriptor.run_id.clone(),
                output_path,
                dump_dir,
                status,
                duration,
            },
            descriptor,
            row,
        })
    }

    fn apply_edits(&self, iteration: &Iteration) -> Result<()> {
        let ws = self.workspace("run")?;
        let layout = &self.config.layout;
        let edits: Vec<FieldEdit> = self
            .targets
            .iter()
            .zip(&iteration.namelist_values)
            .map(|(t, v)| FieldEdit::new(ws.config_file(&t.file), &t.block, &t.field, t.format_value(v)))
            .collect();
        let request = EditRequest::Batch(edits);
        if let Some(unresolved) = editor::apply(&request, self.config.batch_mode)? {
            let target = &self.targets[unresolved.index];
            return Err(CalibError::RequiredEditFailed {
                file: target.file.clone(),
                block: target.block.clone(),
                field: target.field.clone(),
            });
        }

        if !self.soil_names.is_empty() {
            let ancillary = ws.ancillary.as_deref().ok_or_else(|| {
                CalibError::InvalidPlan("soil ancillary was not staged".to_string())
            })?;
            let companion = ws.config_file(&layout.soil.companion_file);
            if !editor::set_soil_field(
                ancillary,
                &self.soil_names,
                &iteration.soil_values,
                &companion,
                &layout.soil,
            )? {
                return Err(CalibError::RequiredEditFailed {
                    file: ancillary.display().to_string(),
                    block: layout.soil.block.clone(),
                    field: layout.soil.names_field.clone(),
                });
            }
        }

        let output_nml = ws.config_file(&layout.output_file);
        if !editor::set_string_field(
            &output_nml,
            &layout.output_block,
            &layout.run_id_field,
            &iteration.run_id,
        )? {
            return Err(CalibError::RequiredEditFailed {
                file: layout.output_file.clone(),
                block: layout.output_block.clone(),
                field: layout.run_id_field.clone(),
            });
        }
        Ok(())
    }

    /// Moves the run's artifact (and dumps, when kept) out of the sink, then
    /// empties the sink.
    fn collect(&self, run_id: &str) -> Result<(PathBuf, Option<PathBuf>)> {
        let staged = self.staged.as_ref().ok_or(CalibError::InvalidState {
            operation: "collect",
            state: self.state.as_str(),
        })?;
        let ws = staged.guard.workspace();
        let layout = &self.config.layout;
        let artifact = layout.output_artifact_name(run_id, &staged.profile_name);
        let produced = ws.output_dir.join(&artifact);
        if !produced.is_file() {
            return Err(CalibError::OutputFileMissing { path: produced });
        }
        let destination = self.config.output_folder.join(&artifact);
        move_file(&produced, &destination)?;

        let mut dump_dir = None;
        if self.config.keep_dump_files {
            let dir = self.config.output_folder.join(format!("{}_dump", run_id));
            ensure_dir(&dir)?;
            relocate_matching(&ws.output_dir, &dir, &layout.dump_marker)?;
            dump_dir = Some(dir);
        }
        purge_dir_contents(&ws.output_dir)?;
        Ok((destination, dump_dir))
    }

    pub fn finish(mut self) -> Result<()> {
        if let Some(staged) = &mut self.staged {
            staged.guard.teardown()?;
        }
        self.state = RunState::Done;
        info!("orchestration done");
        Ok(())
    }

    /// Tears the workspace down after a failure. Ledger rows and relocated
    /// outputs of earlier iterations stay where they are.
    pub fn abort(mut self) {
        self.state = RunState::Failed;
        if let Some(staged) = &mut self.staged {
            if let Err(e) = staged.guard.teardown() {
                warn!("workspace teardown after failure did not complete: {}", e);
            }
        }
    }
}

fn stage_workspace(config: &OrchestratorConfig) -> Result<Staging> {
    let layout = &config.layout;
    let staged = workspace::stage(
        &config.master_dir,
        &config.workspace_dir,
        config.overwrite_workspace,
        layout,
    )?;
    let mut guard = WorkspaceGuard::new(staged);
    if let Some(source) = &config.soil_ancillary {
        workspace::stage_ancillary(guard.workspace_mut(), source, layout)?;
    }
    let sink = guard.workspace().output_dir.clone();
    workspace::redirect_output(guard.workspace(), &sink, layout)?;

    let raw_profile = namelist::read_field_from_file(
        &guard.workspace().config_file(&layout.output_file),
        &layout.profile_block,
        &layout.profile_name_field,
    )?;
    let profile_name = namelist::strip_quotes(&raw_profile).to_string();
    ensure_dir(&config.output_folder)?;
    Ok(Staging {
        guard,
        profile_name,
    })
}

fn staged_workspace<'a>(
    staged: &'a Option<Staging>,
    operation: &'static str,
    state: RunState,
) -> Result<&'a Workspace> {
    staged
        .as_ref()
        .map(|s| s.guard.workspace())
        .ok_or(CalibError::InvalidState {
            operation,
            state: state.as_str(),
        })
}

fn relocate_matching(src_dir: &Path, dst_dir: &Path, marker: &str) -> Result<usize> {
    let mut moved = 0;
    for entry in fs::read_dir(src_dir).at(src_dir)? {
        let entry = entry.at(src_dir)?;
        let name = entry.file_name();
        if entry.path().is_file() && name.to_string_lossy().contains(marker) {
            move_file(&entry.path(), &dst_dir.join(&name))?;
            moved += 1;
        }
    }
    Ok(moved)
}

fn write_resolved_plan(output_folder: &Path, plan: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(plan)?;
    atomic_write_bytes(&output_folder.join("resolved_plan.json"), &bytes)?;
    let digest = canonical_json_digest(plan)?;
    atomic_write_bytes(&output_folder.join("resolved_plan.digest"), digest.as_bytes())
}

pub fn canonical_json_digest(value: &Value) -> Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepParameter {
    pub target: ParameterTarget,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoilSweepParameter {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub config: OrchestratorConfig,
    pub parameters: Vec<SweepParameter>,
    pub soil: Vec<SoilSweepParameter>,
    pub run_ids: RunIdScheme,
}

impl SweepPlan {
    /// Number of iterations. Every value list must have the same length.
    pub fn iteration_count(&self) -> Result<usize> {
        let mut lengths = self
            .parameters
            .iter()
            .map(|p| (p.target.field.as_str(), p.values.len()))
            .chain(self.soil.iter().map(|s| (s.name.as_str(), s.values.len())));
        let Some((first_name, count)) = lengths.next() else {
            return Err(CalibError::InvalidPlan("sweep has no parameters".to_string()));
        };
        for (name, len) in lengths {
            if len != count {
                return Err(CalibError::CardinalityMismatch(format!(
                    "{} has {} values but {} has {}",
                    name, len, first_name, count
                )));
            }
        }
        if count == 0 {
            return Err(CalibError::InvalidPlan("sweep has no values".to_string()));
        }
        if let RunIdScheme::Explicit { ids } = &self.run_ids {
            if ids.len() < count {
                return Err(CalibError::CardinalityMismatch(format!(
                    "{} explicit run ids for {} iterations",
                    ids.len(),
                    count
                )));
            }
        }
        Ok(count)
    }
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub runs: Vec<RunRecord>,
    pub ledger_path: PathBuf,
    pub output_folder: PathBuf,
}

pub fn sweep<S: Simulator>(plan: &SweepPlan, simulator: S) -> Result<SweepReport> {
    let count = plan.iteration_count()?;
    let targets = plan.parameters.iter().map(|p| p.target.clone()).collect();
    let soil_names = plan.soil.iter().map(|s| s.name.clone()).collect();
    let mut orchestrator =
        Orchestrator::init(plan.config.clone(), targets, soil_names, &[], simulator)?;
    let mut ids = RunIdGenerator::new(plan.run_ids.clone());
    let mut runs = Vec::with_capacity(count);

    for i in 0..count {
        let run_id = match ids.next_id() {
            Ok(id) => id,
            Err(e) => {
                orchestrator.abort();
                return Err(e);
            }
        };
        let iteration = Iteration {
            run_id,
            namelist_values: plan.parameters.iter().map(|p| p.values[i].clone()).collect(),
            soil_values: plan.soil.iter().map(|s| s.values[i].clone()).collect(),
        };
        info!(iteration = i + 1, of = count, run_id = %iteration.run_id, "sweep iteration");
        match orchestrator.run(&iteration) {
            Ok(collected) => runs.push(collected.record),
            Err(e) => {
                orchestrator.abort();
                return Err(e);
            }
        }
    }
    orchestrator.finish()?;
    Ok(SweepReport {
        runs,
        ledger_path: plan.config.ledger_path(),
        output_folder: plan.config.output_folder.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn repeat_option_formats_values() {
        let t = ParameterTarget::new("pft.nml", "jules_pftparm", "albedo").with_repeat(5);
        assert_eq!(t.format_value("0.3"), "5*0.3");
        let plain = ParameterTarget::new("pft.nml", "jules_pftparm", "albedo");
        assert_eq!(plain.format_value("0.3"), "0.3");
    }

    fn plan_with(lengths: &[usize], soil: &[usize]) -> SweepPlan {
        let root = std::env::temp_dir().join(format!(
            "calib_orch_plan_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        SweepPlan {
            config: OrchestratorConfig::new(root.join("m"), root.join("w"), root.join("o")),
            parameters: lengths
                .iter()
                .enumerate()
                .map(|(i, n)| SweepParameter {
                    target: ParameterTarget::new("a.nml", "blk", format!("p{}", i)),
                    values: (0..*n).map(|v| v.to_string()).collect(),
                })
                .collect(),
            soil: soil
                .iter()
                .enumerate()
                .map(|(i, n)| SoilSweepParameter {
                    name: format!("s{}", i),
                    values: (0..*n).map(|v| v.to_string()).collect(),
                })
                .collect(),
            run_ids: RunIdScheme::Counter {
                prefix: "t".to_string(),
            },
        }
    }

    #[test]
    fn iteration_count_requires_equal_lengths() {
        assert_eq!(plan_with(&[3, 3], &[]).iteration_count().expect("ok"), 3);
        assert_eq!(plan_with(&[2], &[2]).iteration_count().expect("mixed"), 2);
        assert_eq!(plan_with(&[], &[4]).iteration_count().expect("soil only"), 4);
        assert!(plan_with(&[3, 2], &[]).iteration_count().is_err());
        assert!(plan_with(&[3], &[1]).iteration_count().is_err());
        assert!(plan_with(&[], &[]).iteration_count().is_err());
    }

    #[test]
    fn explicit_ids_must_cover_every_iteration() {
        let mut plan = plan_with(&[3], &[]);
        plan.run_ids = RunIdScheme::Explicit {
            ids: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            plan.iteration_count().expect_err("short").code(),
            "cardinality_mismatch"
        );
    }

    #[test]
    fn digest_is_stable() {
        let a = serde_json::json!({"b": 1, "a": [1, 2]});
        let b = serde_json::json!({"a": [1, 2], "b": 1});
        assert_eq!(
            canonical_json_digest(&a).expect("a"),
            canonical_json_digest(&b).expect("b")
        );
    }
}
