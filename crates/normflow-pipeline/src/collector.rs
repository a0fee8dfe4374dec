use crate::{Modality, ParameterSource, PipelineError, WorkUnit, join_collapsed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub source: String,
    pub destination: String,
}

/// Rename rules for sink-relative paths, built once for the whole run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionTable {
    entries: Vec<Substitution>,
}

impl SubstitutionTable {
    pub fn build(source: &ParameterSource) -> Self {
        let mut entries =
            Vec::with_capacity(Modality::ALL.len() * source.unit_count());
        for modality in Modality::ALL {
            for task in source.tasks() {
                for fwhm in source.widths() {
                    for subject in source.subjects() {
                        let unit = WorkUnit {
                            subject: subject.clone(),
                            task: task.clone(),
                            fwhm: *fwhm,
                        };
                        entries.push(Substitution {
                            source: format!(
                                "{}/{}",
                                unit.iteration_dir(),
                                modality.map_element()
                            ),
                            destination: destination_dir(&unit, modality),
                        });
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[Substitution] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = BTreeSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.source.as_str()) {
                return Err(PipelineError::Collision(format!(
                    "duplicate substitution source '{}'",
                    entry.source
                )));
            }
        }
        Ok(())
    }

    /// Applies every rule in order with plain string replacement.
    pub fn apply(&self, relative: &str) -> String {
        self.entries
            .iter()
            .fold(relative.to_string(), |path, entry| {
                path.replace(&entry.source, &entry.destination)
            })
    }
}

fn destination_dir(unit: &WorkUnit, modality: Modality) -> String {
    match modality {
        Modality::Anat => format!(
            "sub-{}/anat/task-{}/fwhm-{}/",
            unit.subject, unit.task, unit.fwhm
        ),
        Modality::Bold => format!("sub-{}/bold/task-{}/", unit.subject, unit.task),
    }
}

pub fn sink_relative_path(unit: &WorkUnit, modality: Modality, file_name: &str) -> String {
    format!(
        "{}/{}/{}",
        unit.iteration_dir(),
        modality.map_element(),
        file_name
    )
}

#[derive(Clone, Debug)]
pub struct OutputCollector {
    sink_root: PathBuf,
    table: SubstitutionTable,
}

impl OutputCollector {
    pub fn new(sink_root: impl Into<PathBuf>, table: SubstitutionTable) -> Self {
        Self {
            sink_root: sink_root.into(),
            table,
        }
    }

    pub fn table(&self) -> &SubstitutionTable {
        &self.table
    }

    pub fn destination(&self, unit: &WorkUnit, modality: Modality, file_name: &str) -> PathBuf {
        let relative = sink_relative_path(unit, modality, file_name);
        join_collapsed(&self.sink_root, &self.table.apply(&relative))
    }

    /// Copies `produced` into its final location and returns that location.
    pub async fn place(
        &self,
        unit: &WorkUnit,
        modality: Modality,
        produced: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let file_name = produced
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PipelineError::Runtime(format!(
                    "produced path '{}' has no file name",
                    produced.display()
                ))
            })?;
        let destination = self.destination(unit, modality, &file_name);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(produced, &destination).await.map_err(|error| {
            PipelineError::Runtime(format!(
                "failed copying '{}' to '{}': {}",
                produced.display(),
                destination.display(),
                error
            ))
        })?;
        tracing::debug!(unit = %unit, modality = %modality, destination = %destination.display(), "placed output");
        Ok(destination)
    }
}

/// Rejects a plan in which two outputs would land on the same path.
pub fn ensure_unique_destinations<'a>(
    planned: impl IntoIterator<Item = (String, &'a Path)>,
) -> Result<(), PipelineError> {
    let mut owners: BTreeMap<&Path, String> = BTreeMap::new();
    for (owner, path) in planned {
        if let Some(existing) = owners.get(path) {
            return Err(PipelineError::Collision(format!(
                "'{}' is written by both {} and {}",
                path.display(),
                existing,
                owner
            )));
        }
        owners.insert(path, owner);
    }
    Ok(())
}
