pub mod editor;
pub mod error;
pub mod fsutil;
pub mod layout;
pub mod ledger;
pub mod minimize;
pub mod namelist;
pub mod objective;
pub mod optimize;
pub mod orchestrator;
pub mod plan;
pub mod runs;
pub mod series;
pub mod simulator;
pub mod soil;
pub mod workspace;

pub use editor::{BatchMode, EditRequest, FieldEdit};
pub use error::{CalibError, Result, StructureError};
pub use layout::SimulationLayout;
pub use minimize::{CompassSearch, Minimizer, MinimizerKind, NelderMead};
pub use namelist::Namelist;
pub use objective::{ObjectiveSample, VariablePair};
pub use optimize::{optimize, OptimizeParameter, OptimizePlan, OptimizeReport};
pub use orchestrator::{
    sweep, Iteration, Orchestrator, OrchestratorConfig, ParameterTarget, RunState, SweepPlan,
    SweepReport,
};
pub use plan::{load_plan, Plan};
pub use runs::{RunDescriptor, RunIdScheme};
pub use series::{CsvSeriesReader, SeriesSource, TimeSeries};
pub use simulator::{Invocation, ProcessSimulator, SimulationStatus, Simulator};
pub use soil::SoilLayout;
