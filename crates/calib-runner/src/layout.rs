use serde::{Deserialize, Serialize};

use crate::soil::SoilLayout;

/// Names of the files, blocks and fields the controller reads or rewrites
/// inside the simulation's configuration tree. Defaults follow JULES.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationLayout {
    pub output_file: String,
    pub output_block: String,
    pub output_dir_field: String,
    pub run_id_field: String,
    pub profile_block: String,
    pub profile_name_field: String,
    /// Field of the profile block listing the variables the run writes.
    pub profile_vars_field: String,
    pub output_extension: String,
    pub dump_marker: String,
    pub config_extensions: Vec<String>,
    pub soil: SoilLayout,
}

impl Default for SimulationLayout {
    fn default() -> Self {
        Self {
            output_file: "output.nml".to_string(),
            output_block: "jules_output".to_string(),
            output_dir_field: "output_dir".to_string(),
            run_id_field: "run_id".to_string(),
            profile_block: "jules_output_profile".to_string(),
            profile_name_field: "profile_name".to_string(),
            profile_vars_field: "var".to_string(),
            output_extension: "nc".to_string(),
            dump_marker: "dump".to_string(),
            config_extensions: vec!["nml".to_string()],
            soil: SoilLayout::default(),
        }
    }
}

impl SimulationLayout {
    pub fn output_artifact_name(&self, run_id: &str, profile_name: &str) -> String {
        format!("{}.{}.{}", run_id, profile_name, self.output_extension)
    }
}
