use anyhow::Result;
use calib_runner::{editor, namelist, soil, CalibError, MinimizerKind, Plan};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "calib", version = "0.3.0", about = "JULES namelist calibration controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MinimizerArg {
    #[value(name = "nelder_mead")]
    NelderMead,
    #[value(name = "compass_search")]
    CompassSearch,
}

impl From<MinimizerArg> for MinimizerKind {
    fn from(value: MinimizerArg) -> Self {
        match value {
            MinimizerArg::NelderMead => MinimizerKind::NelderMead,
            MinimizerArg::CompassSearch => MinimizerKind::CompassSearch,
        }
    }
}

#[derive(Args, Debug, Default)]
struct PlanOverrides {
    #[arg(long)]
    executable: Option<PathBuf>,
    /// Output folder for ledger, outputs and dumps.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    keep_dumps: bool,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    append: bool,
}

impl PlanOverrides {
    fn apply(self, plan: &mut Plan) -> Result<()> {
        if let Some(executable) = self.executable {
            plan.set_executable(executable)?;
        }
        if let Some(output) = self.output {
            plan.output_folder = output;
        }
        plan.keep_dump_files |= self.keep_dumps;
        plan.overwrite_workspace |= self.overwrite;
        plan.append_to_ledger |= self.append;
        Ok(())
    }
}

#[derive(Subcommand)]
enum Commands {
    Sweep {
        plan: PathBuf,
        #[command(flatten)]
        overrides: PlanOverrides,
        #[arg(long)]
        json: bool,
    },
    Optimize {
        plan: PathBuf,
        #[command(flatten)]
        overrides: PlanOverrides,
        #[arg(long, value_enum)]
        minimizer: Option<MinimizerArg>,
        #[arg(long)]
        max_evaluations: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },
    ReadField {
        file: PathBuf,
        block: String,
        field: String,
        #[arg(long)]
        json: bool,
    },
    SetField {
        file: PathBuf,
        block: String,
        field: String,
        value: String,
        /// Write the value as a quoted string, keeping the field's quote style.
        #[arg(long)]
        string: bool,
        #[arg(long)]
        json: bool,
    },
    SoilNames {
        /// Companion namelist declaring the ancillary's field names.
        companion: PathBuf,
        #[arg(long, default_value = "jules_soil_props")]
        block: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<CalibError>()
                    .map(CalibError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Sweep {
            plan,
            overrides,
            json,
        } => {
            let plan = load_with_overrides(&plan, overrides)?;
            let sweep_plan = plan.sweep_plan()?;
            let report = calib_runner::sweep(&sweep_plan, plan.simulator())?;
            info!(runs = report.runs.len(), "sweep finished");
            if json {
                let runs: Vec<Value> = report
                    .runs
                    .iter()
                    .map(|r| {
                        json!({
                            "run_id": r.run_id,
                            "output": r.output_path.display().to_string(),
                            "dump_dir": r.dump_dir.as_ref().map(|d| d.display().to_string()),
                            "exit_code": r.status.exit_code,
                            "seconds": r.duration.as_secs_f64()
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "ledger": report.ledger_path.display().to_string(),
                    "output_folder": report.output_folder.display().to_string(),
                    "runs": runs
                })));
            }
            for r in &report.runs {
                println!(
                    "run: {} exit={} output={}",
                    r.run_id,
                    r.status.describe(),
                    r.output_path.display()
                );
            }
            println!("runs: {}", report.runs.len());
            println!("ledger: {}", report.ledger_path.display());
        }
        Commands::Optimize {
            plan,
            overrides,
            minimizer,
            max_evaluations,
            json,
        } => {
            let mut plan = load_with_overrides(&plan, overrides)?;
            let section = plan
                .optimize
                .as_mut()
                .ok_or_else(|| CalibError::InvalidPlan("plan has no optimize section".to_string()))?;
            if let Some(m) = minimizer {
                section.minimizer = m.into();
            }
            if let Some(n) = max_evaluations {
                section.max_evaluations = n;
            }
            let kind = section.minimizer;
            let budget = section.max_evaluations;
            let optimize_plan = plan.optimize_plan()?;
            let strategy = kind.build(budget);
            let report = calib_runner::optimize(
                &optimize_plan,
                plan.simulator(),
                &plan.output_reader(),
                strategy.as_ref(),
            )?;
            info!(evaluations = report.outcome.evaluations, "optimization finished");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "optimize",
                    "ledger": report.ledger_path.display().to_string(),
                    "evaluations": report.outcome.evaluations,
                    "converged": report.outcome.converged,
                    "best": report.best,
                    "samples": report.samples
                })));
            }
            println!("evaluations: {}", report.outcome.evaluations);
            println!("converged: {}", report.outcome.converged);
            if let Some(best) = &report.best {
                println!("best_run_id: {}", best.run_id);
                println!("best_rmse: {}", best.weighted);
                for (param, value) in optimize_plan.parameters.iter().zip(&best.parameters) {
                    println!("best.{}: {}", param.target.field, value);
                }
            }
            println!("ledger: {}", report.ledger_path.display());
        }
        Commands::Describe { plan, json } => {
            let plan = calib_runner::load_plan(&plan)?;
            let summary = describe_plan(&plan)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary
                })));
            }
            print_summary(&summary);
        }
        Commands::ReadField {
            file,
            block,
            field,
            json,
        } => {
            let value = namelist::read_field_from_file(&file, &block, &field)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "read-field",
                    "block": block,
                    "field": field,
                    "value": value
                })));
            }
            println!("{}", value);
        }
        Commands::SetField {
            file,
            block,
            field,
            value,
            string,
            json,
        } => {
            let written = if string {
                editor::set_string_field(&file, &block, &field, &value)?
            } else {
                editor::set_field(&file, &block, &field, &value)?
            };
            if !written {
                return Err(CalibError::RequiredEditFailed {
                    file: file.display().to_string(),
                    block,
                    field,
                }
                .into());
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "set-field",
                    "file": file.display().to_string(),
                    "block": block,
                    "field": field
                })));
            }
            println!("updated: {} {}/{}", file.display(), block, field);
        }
        Commands::SoilNames {
            companion,
            block,
            json,
        } => {
            let layout = soil::SoilLayout {
                block,
                ..soil::SoilLayout::default()
            };
            let names = soil::read_field_names(&companion, &layout)?;
            let data_file = soil::declared_data_file(&companion, &layout).ok();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "soil-names",
                    "names": names,
                    "file": data_file
                })));
            }
            if let Some(f) = &data_file {
                println!("file: {}", f);
            }
            for (i, name) in names.iter().enumerate() {
                println!("{}: {}", i, name);
            }
        }
    }
    Ok(None)
}

fn load_with_overrides(path: &Path, overrides: PlanOverrides) -> Result<Plan> {
    let mut plan = calib_runner::load_plan(path)?;
    overrides.apply(&mut plan)?;
    Ok(plan)
}

fn describe_plan(plan: &Plan) -> Result<Value> {
    let mut summary = json!({
        "executable": plan.executable.display().to_string(),
        "master_namelist_dir": plan.master_namelist_dir.display().to_string(),
        "output_folder": plan.output_folder.display().to_string(),
        "workspace_dir": plan.workspace_dir()?.display().to_string(),
        "run_id": serde_json::to_value(&plan.run_id)?,
        "batch_mode": serde_json::to_value(plan.batch_mode)?,
        "keep_dump_files": plan.keep_dump_files,
        "append_to_ledger": plan.append_to_ledger
    });
    if let Some(sweep) = &plan.sweep {
        let sweep_plan = plan.sweep_plan()?;
        let fields: Vec<&str> = sweep
            .parameters
            .iter()
            .map(|p| p.target.field.as_str())
            .chain(sweep.soil.iter().map(|s| s.name.as_str()))
            .collect();
        summary["sweep"] = json!({
            "iterations": sweep_plan.iteration_count()?,
            "parameters": fields,
            "ledger": sweep_plan.config.ledger_path().display().to_string()
        });
    }
    if let Some(opt) = &plan.optimize {
        let fields: Vec<&str> = opt.parameters.iter().map(|p| p.target.field.as_str()).collect();
        let variables: Vec<String> = opt
            .variables
            .iter()
            .map(|v| format!("{}~{}", v.observed, v.simulated))
            .collect();
        summary["optimize"] = json!({
            "parameters": fields,
            "variables": variables,
            "minimizer": serde_json::to_value(opt.minimizer)?,
            "max_evaluations": opt.max_evaluations,
            "observations": opt.observations.path.display().to_string(),
            "ledger": plan
                .output_folder
                .join(calib_runner::OptimizePlan::ledger_name(&opt.run_id_prefix))
                .display()
                .to_string()
        });
    }
    Ok(summary)
}

fn print_summary(summary: &Value) {
    print_value("", summary);
}

fn print_value(prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                print_value(&key, v);
            }
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(scalar_text).collect();
            println!("{}: {}", prefix, parts.join(", "));
        }
        other => println!("{}: {}", prefix, scalar_text(other)),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sweep { json, .. }
        | Commands::Optimize { json, .. }
        | Commands::Describe { json, .. }
        | Commands::ReadField { json, .. }
        | Commands::SetField { json, .. }
        | Commands::SoilNames { json, .. } => *json,
    }
}
