use chrono::NaiveDateTime;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::{CalibError, Result};
use crate::minimize::{Bounds, MinimizeOutcome, Minimizer};
use crate::namelist;
use crate::objective::{self, MetricColumns, ObjectiveSample, VariablePair};
use crate::orchestrator::{Iteration, Orchestrator, OrchestratorConfig, ParameterTarget};
use crate::runs::next_run_id;
use crate::series::{SeriesSource, TimeSeries};
use crate::simulator::Simulator;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeParameter {
    pub target: ParameterTarget,
    /// Read from the staged namelist when unset.
    pub initial: Option<f64>,
    pub bounds: Option<Bounds>,
}

#[derive(Debug, Clone)]
pub struct OptimizePlan {
    pub config: OrchestratorConfig,
    pub parameters: Vec<OptimizeParameter>,
    /// Run ids are `<prefix>_1`, `<prefix>_2`, ... in evaluation order.
    pub run_id_prefix: String,
    pub observations: TimeSeries,
    pub variables: Vec<VariablePair>,
    pub metrics: MetricColumns,
    pub window: Option<(NaiveDateTime, NaiveDateTime)>,
    pub check_output_declared: bool,
}

impl OptimizePlan {
    pub fn ledger_name(prefix: &str) -> String {
        format!("{}_run_info.csv", prefix)
    }

    fn obs_keys(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.observed.clone()).collect()
    }

    fn sim_keys(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.simulated.clone()).collect()
    }

    fn weights(&self) -> Option<Vec<f64>> {
        if self.variables.iter().all(|v| v.weight.is_none()) {
            return None;
        }
        Some(self.variables.iter().map(|v| v.weight.unwrap_or(1.0)).collect())
    }

    fn validate(&self) -> Result<()> {
        if self.parameters.is_empty() {
            return Err(CalibError::InvalidPlan("no parameters to optimize".to_string()));
        }
        if self.variables.is_empty() {
            return Err(CalibError::InvalidPlan("no variables to compare".to_string()));
        }
        for p in &self.parameters {
            if let Some((lo, hi)) = p.bounds {
                if !(lo <= hi) {
                    return Err(CalibError::InvalidPlan(format!(
                        "bounds for {} are inverted",
                        p.target.field
                    )));
                }
            }
        }
        let bounded = self.parameters.iter().filter(|p| p.bounds.is_some()).count();
        if bounded != 0 && bounded != self.parameters.len() {
            return Err(CalibError::InvalidPlan(
                "bounds must be given for every parameter or none".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OptimizeReport {
    pub best: Option<ObjectiveSample>,
    pub samples: Vec<ObjectiveSample>,
    pub outcome: MinimizeOutcome,
    pub ledger_path: PathBuf,
}

/// Parses a namelist value into a starting point: `N*v` yields `v`, a list
/// yields its first element, Fortran `d` exponents are accepted.
pub fn parse_initial_value(raw: &str) -> Option<f64> {
    let first = raw.split(',').map(str::trim).find(|s| !s.is_empty())?;
    let scalar = match first.split_once('*') {
        Some((count, value)) if count.trim().chars().all(|c| c.is_ascii_digit()) => value,
        _ => first,
    };
    namelist::strip_quotes(scalar)
        .replace(&['d', 'D'][..], "e")
        .parse::<f64>()
        .ok()
}

/// Renders a proposal so the namelist reads it as a real.
pub fn format_real(value: f64) -> String {
    let text = value.to_string();
    if text.contains(&['.', 'e', 'E'][..]) || !value.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

/// One objective call is one orchestrated run: write the proposal, run,
/// read the output, score it, and complete the ledger row.
struct Objective<'a, S: Simulator, R: SeriesSource> {
    orchestrator: &'a mut Orchestrator<S>,
    reader: &'a R,
    observed: TimeSeries,
    obs_keys: Vec<String>,
    sim_keys: Vec<String>,
    weights: Option<Vec<f64>>,
    window: Option<(NaiveDateTime, NaiveDateTime)>,
    metrics: MetricColumns,
    last_run_id: String,
    samples: Vec<ObjectiveSample>,
}

impl<'a, S: Simulator, R: SeriesSource> Objective<'a, S, R> {
    fn evaluate(&mut self, x: &[f64]) -> Result<f64> {
        let run_id = next_run_id(&self.last_run_id);
        self.last_run_id = run_id.clone();
        let iteration = Iteration {
            run_id: run_id.clone(),
            namelist_values: x.iter().map(|v| format_real(*v)).collect(),
            soil_values: Vec::new(),
        };
        let collected = self.orchestrator.run(&iteration)?;
        let simulated = self
            .reader
            .load(&collected.record.output_path, &self.sim_keys)?;
        let score = objective::evaluate(
            &self.observed,
            &simulated,
            &self.obs_keys,
            &self.sim_keys,
            self.weights.as_deref(),
            self.window,
        )?;
        let sample = ObjectiveSample {
            run_id,
            parameters: x.to_vec(),
            per_variable: self.obs_keys.iter().cloned().zip(score.per_variable).collect(),
            weighted: score.weighted,
            duration: collected.record.duration,
        };
        collected.row.finish(&self.metrics.cells(&sample))?;
        info!(run_id = %sample.run_id, rmse = sample.weighted, "objective sample");
        self.samples.push(sample);
        Ok(score.weighted)
    }
}

pub fn optimize<S, R, M>(
    plan: &OptimizePlan,
    simulator: S,
    reader: &R,
    minimizer: &M,
) -> Result<OptimizeReport>
where
    S: Simulator,
    R: SeriesSource,
    M: Minimizer + ?Sized,
{
    plan.validate()?;
    let obs_keys = plan.obs_keys();
    let sim_keys = plan.sim_keys();
    let observed = plan.observations.select(&obs_keys)?;
    let targets: Vec<ParameterTarget> = plan.parameters.iter().map(|p| p.target.clone()).collect();
    let mut orchestrator = Orchestrator::init(
        plan.config.clone(),
        targets,
        Vec::new(),
        &plan.metrics.header(&obs_keys),
        simulator,
    )?;

    let prepared = prepare(plan, &orchestrator, &sim_keys);
    let x0 = match prepared {
        Ok(x0) => x0,
        Err(e) => {
            orchestrator.abort();
            return Err(e);
        }
    };
    let bounds: Option<Vec<Bounds>> = plan.parameters.iter().map(|p| p.bounds).collect();
    info!(
        parameters = plan.parameters.len(),
        start = ?x0,
        "starting optimization"
    );

    let mut objective = Objective {
        orchestrator: &mut orchestrator,
        reader,
        observed,
        obs_keys,
        sim_keys,
        weights: plan.weights(),
        window: plan.window,
        metrics: plan.metrics,
        last_run_id: format!("{}_0", plan.run_id_prefix),
        samples: Vec::new(),
    };
    let result = minimizer.minimize(&mut |x| objective.evaluate(x), &x0, bounds.as_deref());
    let Objective { samples, .. } = objective;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            orchestrator.abort();
            return Err(e);
        }
    };
    if !outcome.converged {
        warn!(evaluations = outcome.evaluations, "evaluation budget exhausted before convergence");
    }
    let ledger_path = orchestrator.ledger().path().to_path_buf();
    orchestrator.finish()?;

    let best = samples
        .iter()
        .filter(|s| s.weighted.is_finite())
        .min_by(|a, b| a.weighted.total_cmp(&b.weighted))
        .cloned();
    Ok(OptimizeReport {
        best,
        samples,
        outcome,
        ledger_path,
    })
}

fn prepare<S: Simulator>(
    plan: &OptimizePlan,
    orchestrator: &Orchestrator<S>,
    sim_keys: &[String],
) -> Result<Vec<f64>> {
    let layout = &orchestrator.config().layout;
    if plan.check_output_declared {
        objective::check_declared_outputs(
            &orchestrator.staged_file(&layout.output_file)?,
            layout,
            sim_keys,
        )?;
    }
    plan.parameters
        .iter()
        .map(|p| match p.initial {
            Some(v) => Ok(v),
            None => {
                let t = &p.target;
                let raw = namelist::read_field_from_file(
                    &orchestrator.staged_file(&t.file)?,
                    &t.block,
                    &t.field,
                )?;
                parse_initial_value(&raw).ok_or_else(|| {
                    CalibError::InvalidPlan(format!(
                        "cannot read a numeric starting value for {}/{} from '{}'",
                        t.block, t.field, raw
                    ))
                })
            }
        })
        .collect()
}
