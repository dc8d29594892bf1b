use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{CalibError, IoContext, Result};
use crate::fsutil::ensure_dir;

/// Everything a simulation needs to know about one invocation. The working
/// directory is passed explicitly; the controller never changes its own.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub working_dir: &'a Path,
    pub output_dir: &'a Path,
    pub run_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationStatus {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl SimulationStatus {
    pub fn success() -> Self {
        Self { exit_code: Some(0) }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn describe(&self) -> String {
        self.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

/// Runs one simulation to completion. Blocking; no timeout.
pub trait Simulator {
    fn run(&mut self, invocation: &Invocation<'_>) -> Result<SimulationStatus>;
}

impl<S: Simulator + ?Sized> Simulator for &mut S {
    fn run(&mut self, invocation: &Invocation<'_>) -> Result<SimulationStatus> {
        (**self).run(invocation)
    }
}

/// Spawns the simulation executable with the staged namelist directory as
/// its working directory.
#[derive(Debug, Clone)]
pub struct ProcessSimulator {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// When set, stdout and stderr go to `<log_dir>/<run_id>.log`.
    pub log_dir: Option<PathBuf>,
}

impl ProcessSimulator {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            log_dir: None,
        }
    }
}

impl Simulator for ProcessSimulator {
    fn run(&mut self, invocation: &Invocation<'_>) -> Result<SimulationStatus> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args);
        cmd.current_dir(invocation.working_dir);
        cmd.stdin(Stdio::null());
        if let Some(log_dir) = &self.log_dir {
            ensure_dir(log_dir)?;
            let log_path = log_dir.join(format!("{}.log", invocation.run_id));
            let log = fs::File::create(&log_path).at(&log_path)?;
            let log_err = log.try_clone().at(&log_path)?;
            cmd.stdout(Stdio::from(log));
            cmd.stderr(Stdio::from(log_err));
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        debug!(
            executable = %self.executable.display(),
            cwd = %invocation.working_dir.display(),
            run_id = invocation.run_id,
            "launching simulation"
        );
        let status = cmd
            .status()
            .map_err(|source| CalibError::SimulationLaunch {
                executable: self.executable.clone(),
                source,
            })?;
        Ok(SimulationStatus {
            exit_code: status.code(),
        })
    }
}
