use crate::{PipelineConfig, WorkUnit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Anat,
    Bold,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Anat, Modality::Bold];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anat => "anat",
            Self::Bold => "bold",
        }
    }

    pub fn node_name(self) -> &'static str {
        match self {
            Self::Anat => "apply_norm_anat",
            Self::Bold => "apply_norm_bold",
        }
    }

    /// Name of the first (and only) map element below the node.
    pub fn map_element(self) -> String {
        format!("_{}0", self.node_name())
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working-directory layout of one workflow run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowLayout {
    workflow_root: PathBuf,
    sink_root: PathBuf,
}

impl WorkflowLayout {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            workflow_root: config.workflow_root(),
            sink_root: config.sink_root(),
        }
    }

    pub fn workflow_root(&self) -> &PathBuf {
        &self.workflow_root
    }

    pub fn sink_root(&self) -> &PathBuf {
        &self.sink_root
    }

    pub fn iteration_dir(&self, unit: &WorkUnit) -> PathBuf {
        self.workflow_root.join(unit.iteration_dir())
    }

    pub fn node_dir(&self, unit: &WorkUnit, modality: Modality) -> PathBuf {
        self.iteration_dir(unit)
            .join(modality.node_name())
            .join("mapflow")
            .join(modality.map_element())
    }

    pub fn status_path(&self, unit: &WorkUnit) -> PathBuf {
        self.iteration_dir(unit).join("status.json")
    }
}
