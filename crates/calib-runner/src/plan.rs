//! YAML calibration plans.
//!
//! A plan names the executable, the master configuration tree, where outputs
//! go, and either a `sweep` or an `optimize` section (or both). Relative
//! paths are resolved against the plan file's directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::editor::BatchMode;
use crate::error::{CalibError, IoContext, Result};
use crate::fsutil::absolute;
use crate::layout::SimulationLayout;
use crate::minimize::MinimizerKind;
use crate::objective::{MetricColumns, VariablePair};
use crate::optimize::{OptimizeParameter, OptimizePlan};
use crate::orchestrator::{
    OrchestratorConfig, ParameterTarget, SoilSweepParameter, SweepParameter, SweepPlan,
    DEFAULT_LEDGER_NAME,
};
use crate::runs::RunIdScheme;
use crate::series::{parse_timestamp, CsvSeriesReader};
use crate::simulator::ProcessSimulator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub executable: PathBuf,
    #[serde(default)]
    pub executable_args: Vec<String>,
    /// Capture each run's stdout/stderr under `<output_folder>/logs`.
    #[serde(default)]
    pub capture_logs: bool,
    pub master_namelist_dir: PathBuf,
    pub output_folder: PathBuf,
    /// Defaults to `./tmp` in the current directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    #[serde(default)]
    pub overwrite_workspace: bool,
    #[serde(default)]
    pub append_to_ledger: bool,
    #[serde(default)]
    pub keep_dump_files: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_ancillary: Option<PathBuf>,
    #[serde(default)]
    pub batch_mode: BatchMode,
    #[serde(default = "default_run_ids")]
    pub run_id: RunIdScheme,
    #[serde(default)]
    pub layout: SimulationLayout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<OptimizeSection>,
}

fn default_run_ids() -> RunIdScheme {
    RunIdScheme::Counter {
        prefix: "run".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSection {
    #[serde(default)]
    pub parameters: Vec<SweepParameterSpec>,
    #[serde(default)]
    pub soil: Vec<SoilSweepSpec>,
    #[serde(default = "default_ledger")]
    pub ledger: String,
}

fn default_ledger() -> String {
    DEFAULT_LEDGER_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParameterSpec {
    #[serde(flatten)]
    pub target: ParameterTarget,
    pub values: Vec<ScalarValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilSweepSpec {
    pub name: String,
    pub values: Vec<ScalarValue>,
}

/// A literal value as written in YAML. Numbers keep the spelling serde gives
/// them; strings are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ScalarValue {
    pub fn literal(&self) -> String {
        match self {
            ScalarValue::Int(v) => v.to_string(),
            ScalarValue::Float(v) => crate::optimize::format_real(*v),
            ScalarValue::Bool(true) => ".true.".to_string(),
            ScalarValue::Bool(false) => ".false.".to_string(),
            ScalarValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeSection {
    pub parameters: Vec<OptimizeParameterSpec>,
    pub observations: ObservationSource,
    pub variables: Vec<VariablePair>,
    #[serde(default = "default_optimize_prefix")]
    pub run_id_prefix: String,
    #[serde(default)]
    pub minimizer: MinimizerKind,
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations: usize,
    #[serde(default = "default_true")]
    pub save_rmse: bool,
    #[serde(default)]
    pub save_run_time: bool,
    /// Inclusive `[start, end]` timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<[String; 2]>,
    /// Timestamp column in the simulation's output table.
    #[serde(default = "default_time_column")]
    pub output_time_column: String,
    #[serde(default = "default_true")]
    pub check_output_declared: bool,
}

fn default_optimize_prefix() -> String {
    "opt".to_string()
}

fn default_max_evaluations() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_time_column() -> String {
    "time".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeParameterSpec {
    #[serde(flatten)]
    pub target: ParameterTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSource {
    pub path: PathBuf,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_format: Option<String>,
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let text = fs::read_to_string(path).at(path)?;
    let mut plan: Plan = serde_yaml::from_str(&text)?;
    let path = absolute(path)?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    plan.resolve_paths(&base);
    Ok(plan)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl Plan {
    /// Bare executable names are left for `PATH` lookup.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.executable.components().count() > 1 {
            self.executable = resolve(base, &self.executable);
        }
        self.master_namelist_dir = resolve(base, &self.master_namelist_dir);
        self.output_folder = resolve(base, &self.output_folder);
        if let Some(ws) = &self.workspace_dir {
            self.workspace_dir = Some(resolve(base, ws));
        }
        if let Some(soil) = &self.soil_ancillary {
            self.soil_ancillary = Some(resolve(base, soil));
        }
        if let Some(opt) = &mut self.optimize {
            opt.observations.path = resolve(base, &opt.observations.path);
        }
    }

    /// Replaces the executable. A path with a directory part is anchored at
    /// the current directory, since the simulation runs from the workspace.
    pub fn set_executable(&mut self, executable: PathBuf) -> Result<()> {
        self.executable = if executable.components().count() > 1 {
            absolute(&executable)?
        } else {
            executable
        };
        Ok(())
    }

    pub fn workspace_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let cwd = std::env::current_dir().at(Path::new("."))?;
                Ok(cwd.join("tmp"))
            }
        }
    }

    pub fn orchestrator_config(&self, ledger_name: &str) -> Result<OrchestratorConfig> {
        Ok(OrchestratorConfig {
            master_dir: self.master_namelist_dir.clone(),
            workspace_dir: self.workspace_dir()?,
            output_folder: self.output_folder.clone(),
            ledger_name: ledger_name.to_string(),
            overwrite_workspace: self.overwrite_workspace,
            append_to_ledger: self.append_to_ledger,
            keep_dump_files: self.keep_dump_files,
            soil_ancillary: self.soil_ancillary.clone(),
            batch_mode: self.batch_mode,
            layout: self.layout.clone(),
            resolved_plan: Some(serde_json::to_value(self)?),
        })
    }

    pub fn simulator(&self) -> ProcessSimulator {
        ProcessSimulator {
            executable: self.executable.clone(),
            args: self.executable_args.clone(),
            log_dir: self.capture_logs.then(|| self.output_folder.join("logs")),
        }
    }

    pub fn sweep_plan(&self) -> Result<SweepPlan> {
        let section = self
            .sweep
            .as_ref()
            .ok_or_else(|| CalibError::InvalidPlan("plan has no sweep section".to_string()))?;
        let plan = SweepPlan {
            config: self.orchestrator_config(&section.ledger)?,
            parameters: section
                .parameters
                .iter()
                .map(|p| SweepParameter {
                    target: p.target.clone(),
                    values: p.values.iter().map(ScalarValue::literal).collect(),
                })
                .collect(),
            soil: section
                .soil
                .iter()
                .map(|s| SoilSweepParameter {
                    name: s.name.clone(),
                    values: s.values.iter().map(ScalarValue::literal).collect(),
                })
                .collect(),
            run_ids: self.run_id.clone(),
        };
        plan.iteration_count()?;
        Ok(plan)
    }

    /// Loads observations eagerly so a bad file fails before staging.
    pub fn optimize_plan(&self) -> Result<OptimizePlan> {
        let section = self
            .optimize
            .as_ref()
            .ok_or_else(|| CalibError::InvalidPlan("plan has no optimize section".to_string()))?;
        let obs = &section.observations;
        let reader = CsvSeriesReader {
            time_column: obs.time_column.clone(),
            time_format: obs.time_format.clone(),
            ..CsvSeriesReader::default()
        };
        let obs_keys: Vec<String> = section.variables.iter().map(|v| v.observed.clone()).collect();
        let observations = reader.read(&obs.path, &obs_keys)?;
        let window = match &section.window {
            Some([start, end]) => Some((parse_timestamp(start, None)?, parse_timestamp(end, None)?)),
            None => None,
        };
        Ok(OptimizePlan {
            config: self.orchestrator_config(&OptimizePlan::ledger_name(&section.run_id_prefix))?,
            parameters: section
                .parameters
                .iter()
                .map(|p| OptimizeParameter {
                    target: p.target.clone(),
                    initial: p.initial,
                    bounds: p.bounds.map(|[lo, hi]| (lo, hi)),
                })
                .collect(),
            run_id_prefix: section.run_id_prefix.clone(),
            observations,
            variables: section.variables.clone(),
            metrics: MetricColumns {
                save_rmse: section.save_rmse,
                save_run_time: section.save_run_time,
            },
            window,
            check_output_declared: section.check_output_declared,
        })
    }

    pub fn output_reader(&self) -> CsvSeriesReader {
        let time_column = self
            .optimize
            .as_ref()
            .map(|o| o.output_time_column.clone())
            .unwrap_or_else(default_time_column);
        CsvSeriesReader::new(time_column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
executable: bin/jules.exe
master_namelist_dir: config
output_folder: /abs/output
run_id:
  scheme: counter
  prefix: test
sweep:
  parameters:
    - file: pft_params.nml
      block: jules_pftparm
      field: albedo
      repeat: 5
      values: [0.1, 0.2, 1]
  soil:
    - name: b
      values: ["5.0", 6, 7.5]
optimize:
  parameters:
    - file: pft_params.nml
      block: jules_pftparm
      field: albedo
      bounds: [0.0, 1.0]
  observations:
    path: obs.csv
  variables:
    - observed: gpp_obs
      simulated: gpp
"#;

    fn parsed() -> Plan {
        let mut plan: Plan = serde_yaml::from_str(PLAN).expect("yaml");
        plan.resolve_paths(Path::new("/plans"));
        plan
    }

    #[test]
    fn parses_sections_with_defaults() {
        let plan = parsed();
        assert_eq!(plan.layout, SimulationLayout::default());
        assert_eq!(plan.batch_mode, BatchMode::ShortCircuit);
        let sweep = plan.sweep.as_ref().expect("sweep");
        assert_eq!(sweep.ledger, "run_info.csv");
        assert_eq!(sweep.parameters[0].target.repeat, Some(5));
        let literals: Vec<String> = sweep.parameters[0].values.iter().map(ScalarValue::literal).collect();
        assert_eq!(literals, vec!["0.1", "0.2", "1"]);
        let opt = plan.optimize.as_ref().expect("optimize");
        assert_eq!(opt.minimizer, MinimizerKind::NelderMead);
        assert_eq!(opt.max_evaluations, 100);
        assert!(opt.save_rmse && !opt.save_run_time);
        assert_eq!(opt.run_id_prefix, "opt");
    }

    #[test]
    fn relative_paths_resolve_against_plan_dir() {
        let plan = parsed();
        assert_eq!(plan.executable, PathBuf::from("/plans/bin/jules.exe"));
        assert_eq!(plan.master_namelist_dir, PathBuf::from("/plans/config"));
        assert_eq!(plan.output_folder, PathBuf::from("/abs/output"));
        assert_eq!(
            plan.optimize.as_ref().expect("optimize").observations.path,
            PathBuf::from("/plans/obs.csv")
        );

        let mut bare = parsed();
        bare.executable = PathBuf::from("jules.exe");
        bare.resolve_paths(Path::new("/plans"));
        assert_eq!(bare.executable, PathBuf::from("jules.exe"));
    }

    #[test]
    fn executable_override_is_anchored_at_cwd() {
        let mut plan = parsed();
        plan.set_executable(PathBuf::from("bin/sim.sh")).expect("relative");
        assert!(plan.executable.is_absolute());
        assert!(plan.executable.ends_with("bin/sim.sh"));

        plan.set_executable(PathBuf::from("jules.exe")).expect("bare");
        assert_eq!(plan.executable, PathBuf::from("jules.exe"));
        plan.set_executable(PathBuf::from("/opt/jules.exe")).expect("absolute");
        assert_eq!(plan.executable, PathBuf::from("/opt/jules.exe"));
    }

    #[test]
    fn sweep_plan_carries_literals_and_ledger() {
        let plan = parsed();
        let sweep = plan.sweep_plan().expect("sweep plan");
        assert_eq!(sweep.iteration_count().expect("count"), 3);
        assert_eq!(sweep.soil[0].values, vec!["5.0", "6", "7.5"]);
        assert_eq!(sweep.config.ledger_path(), PathBuf::from("/abs/output/run_info.csv"));
        assert!(sweep.config.resolved_plan.is_some());
    }

    #[test]
    fn mismatched_sweep_lengths_are_rejected() {
        let mut plan = parsed();
        if let Some(sweep) = plan.sweep.as_mut() {
            sweep.soil[0].values.pop();
        }
        assert_eq!(
            plan.sweep_plan().expect_err("mismatch").code(),
            "cardinality_mismatch"
        );
    }
}
