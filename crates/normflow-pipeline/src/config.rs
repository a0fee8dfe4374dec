use crate::{PathTemplate, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Worker slots reserved per subject when sizing the dispatcher pool.
pub const WORKERS_PER_SUBJECT: usize = 3;

pub const DEFAULT_EXPERIMENT_DIR: &str = "/data/wellbeing_analysis";
pub const DEFAULT_TEMPLATE: &str = "/home/zohyos7/fmri/mni_icbm152_nlin_asym_09c/1mm_T1.nii.gz";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub experiment_dir: PathBuf,
    pub output_dir: String,
    pub working_dir: String,
    pub workflow_name: String,
    pub tasks: Vec<String>,
    pub fwhm: Vec<u32>,
    pub template: PathBuf,
    pub templates: InputTemplates,
    pub applicator: ApplyTransformsSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            experiment_dir: PathBuf::from(DEFAULT_EXPERIMENT_DIR),
            output_dir: "datasink".to_string(),
            working_dir: "workingdir".to_string(),
            workflow_name: "antsflow".to_string(),
            tasks: vec!["empathy".to_string()],
            fwhm: vec![4, 8],
            template: PathBuf::from(DEFAULT_TEMPLATE),
            templates: InputTemplates::default(),
            applicator: ApplyTransformsSettings::default(),
        }
    }
}

/// Input path templates, relative to the experiment directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputTemplates {
    pub bold: String,
    pub anat: String,
    pub transform: String,
}

impl Default for InputTemplates {
    fn default() -> Self {
        Self {
            bold: "datasink/preproc/sub-{subject_id}/task-{task_name}/fwhm-{fwhm_id}_sasub-{subject_id}_task-{task_name}_bold.nii".to_string(),
            anat: "datasink/preproc/sub-{subject_id}/task-{task_name}/sub-{subject_id}_T1w_brain.nii.gz".to_string(),
            transform: "datasink/antsreg/sub-{subject_id}/transformComposite.h5".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    Linear,
    NearestNeighbor,
    MultiLabel,
    Gaussian,
    BSpline,
    CosineWindowedSinc,
    WelchWindowedSinc,
    HammingWindowedSinc,
    LanczosWindowedSinc,
    GenericLabel,
}

impl Interpolation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "Linear",
            Self::NearestNeighbor => "NearestNeighbor",
            Self::MultiLabel => "MultiLabel",
            Self::Gaussian => "Gaussian",
            Self::BSpline => "BSpline",
            Self::CosineWindowedSinc => "CosineWindowedSinc",
            Self::WelchWindowedSinc => "WelchWindowedSinc",
            Self::HammingWindowedSinc => "HammingWindowedSinc",
            Self::LanczosWindowedSinc => "LanczosWindowedSinc",
            Self::GenericLabel => "GenericLabel",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyTransformsSettings {
    pub program: String,
    pub interpolation: Interpolation,
    /// 0 scalar, 1 vector, 2 tensor, 3 time series.
    pub input_image_type: u8,
    pub invert_transform: bool,
    pub num_threads: usize,
    pub float_precision: bool,
    pub default_value: f64,
    pub output_postfix: String,
}

impl Default for ApplyTransformsSettings {
    fn default() -> Self {
        Self {
            program: "antsApplyTransforms".to_string(),
            interpolation: Interpolation::BSpline,
            input_image_type: 3,
            invert_transform: false,
            num_threads: 8,
            float_precision: true,
            default_value: 0.0,
            output_postfix: "_trans".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path).map_err(|error| {
            PipelineError::InvalidConfig(format!(
                "failed reading config '{}': {}",
                path.display(),
                error
            ))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            PipelineError::InvalidConfig(format!(
                "failed parsing config '{}': {}",
                path.display(),
                error
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.tasks.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one task is required".to_string(),
            ));
        }
        if self.fwhm.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one smoothing width is required".to_string(),
            ));
        }
        if let Some(task) = first_duplicate(self.tasks.iter()) {
            return Err(PipelineError::InvalidConfig(format!(
                "duplicate task '{task}'"
            )));
        }
        if let Some(width) = first_duplicate(self.fwhm.iter()) {
            return Err(PipelineError::InvalidConfig(format!(
                "duplicate smoothing width {width}"
            )));
        }
        if self.tasks.iter().any(|task| task.trim().is_empty()) {
            return Err(PipelineError::InvalidConfig(
                "task names cannot be blank".to_string(),
            ));
        }
        for (name, dir) in [
            ("output_dir", &self.output_dir),
            ("working_dir", &self.working_dir),
            ("workflow_name", &self.workflow_name),
        ] {
            if dir.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(format!("{name} cannot be empty")));
            }
        }
        if self.applicator.program.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "applicator program cannot be empty".to_string(),
            ));
        }
        if self.applicator.num_threads == 0 {
            return Err(PipelineError::InvalidConfig(
                "applicator num_threads must be at least 1".to_string(),
            ));
        }
        if self.applicator.input_image_type > 3 {
            return Err(PipelineError::InvalidConfig(format!(
                "input_image_type must be 0..=3, got {}",
                self.applicator.input_image_type
            )));
        }

        PathTemplate::parse(&self.templates.bold)?;
        PathTemplate::parse(&self.templates.anat)?;
        PathTemplate::parse(&self.templates.transform)?;
        Ok(())
    }

    pub fn sink_root(&self) -> PathBuf {
        self.experiment_dir.join(&self.output_dir)
    }

    pub fn workflow_root(&self) -> PathBuf {
        self.experiment_dir
            .join(&self.working_dir)
            .join(&self.workflow_name)
    }
}

fn first_duplicate<T: Ord + Clone>(items: impl Iterator<Item = T>) -> Option<T> {
    let mut seen = BTreeSet::new();
    items.into_iter().find(|item| !seen.insert(item.clone()))
}
