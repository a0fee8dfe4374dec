use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Smoothing kernel FWHM already baked into the preprocessed file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SmoothingWidth(u32);

impl SmoothingWidth {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SmoothingWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub subject: SubjectId,
    pub task: TaskName,
    pub fwhm: SmoothingWidth,
}

impl WorkUnit {
    /// Iteration directory name, parameters in alphabetical order.
    pub fn iteration_dir(&self) -> String {
        format!(
            "_fwhm_id_{}_subject_id_{}_task_name_{}",
            self.fwhm, self.subject, self.task
        )
    }

    pub fn label(&self) -> String {
        format!("sub-{}/task-{}/fwhm-{}", self.subject, self.task, self.fwhm)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSource {
    subjects: Vec<SubjectId>,
    tasks: Vec<TaskName>,
    widths: Vec<SmoothingWidth>,
}

impl ParameterSource {
    pub fn new<S>(
        subjects: impl IntoIterator<Item = S>,
        tasks: &[String],
        widths: &[u32],
    ) -> Result<Self, PipelineError>
    where
        S: Into<String>,
    {
        let subjects: Vec<SubjectId> = subjects.into_iter().map(SubjectId::new).collect();
        if subjects.is_empty() {
            return Err(PipelineError::Usage("Should pass subject IDs.".to_string()));
        }
        if tasks.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "task list cannot be empty".to_string(),
            ));
        }
        if widths.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "smoothing width list cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            subjects,
            tasks: tasks.iter().cloned().map(TaskName::new).collect(),
            widths: widths.iter().copied().map(SmoothingWidth::new).collect(),
        })
    }

    pub fn subjects(&self) -> &[SubjectId] {
        &self.subjects
    }

    pub fn tasks(&self) -> &[TaskName] {
        &self.tasks
    }

    pub fn widths(&self) -> &[SmoothingWidth] {
        &self.widths
    }

    pub fn unit_count(&self) -> usize {
        self.subjects.len() * self.tasks.len() * self.widths.len()
    }

    pub fn work_units(&self) -> Vec<WorkUnit> {
        let mut units = Vec::with_capacity(self.unit_count());
        for subject in &self.subjects {
            for task in &self.tasks {
                for fwhm in &self.widths {
                    units.push(WorkUnit {
                        subject: subject.clone(),
                        task: task.clone(),
                        fwhm: *fwhm,
                    });
                }
            }
        }
        units
    }
}
