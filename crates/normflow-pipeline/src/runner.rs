use crate::{
    AntsApplyTransforms, Dispatcher, FileResolver, Modality, OutputCollector, ParameterSource,
    PipelineConfig, PipelineError, PipelineEvent, ResolvedInputs, RuntimeEventKind,
    RuntimeEventSink, SharedTransformApplicator, StageEvent, SubstitutionTable, TransformApplicator,
    TransformRequest, UnitEvent, WorkUnit, WorkflowLayout, ensure_unique_destinations,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub const DATASINK_STAGE: &str = "datasink";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Fail,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Fail,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedApplication {
    pub request: TransformRequest,
    pub command_line: Vec<String>,
    pub output_image: PathBuf,
    pub destination: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedUnit {
    pub unit: WorkUnit,
    pub inputs: ResolvedInputs,
    pub anat: PlannedApplication,
    pub bold: PlannedApplication,
}

/// Everything the run will do, computed before any tool is launched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlan {
    pub run_id: String,
    pub n_procs: usize,
    pub subjects: Vec<String>,
    pub units: Vec<PlannedUnit>,
    pub substitutions: SubstitutionTable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub status: NodeStatus,
    pub duration_ms: u128,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: WorkUnit,
    pub status: NodeStatus,
    pub inputs: ResolvedInputs,
    pub stages: Vec<StageReport>,
    pub outputs: BTreeMap<Modality, PathBuf>,
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub run_id: String,
    pub status: PipelineStatus,
    pub n_procs: usize,
    pub units: Vec<UnitReport>,
}

impl PipelineRunResult {
    pub fn failed_units(&self) -> impl Iterator<Item = &UnitReport> {
        self.units
            .iter()
            .filter(|report| report.status != NodeStatus::Success)
    }

    pub fn completed_units(&self) -> impl Iterator<Item = &UnitReport> {
        self.units
            .iter()
            .filter(|report| report.status == NodeStatus::Success)
    }
}

#[derive(Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub events: RuntimeEventSink,
    /// Defaults to `antsApplyTransforms` built from the config.
    pub applicator: Option<SharedTransformApplicator>,
}

#[derive(Debug, Default)]
pub struct PipelineRunner;

impl PipelineRunner {
    pub fn plan(
        &self,
        config: &PipelineConfig,
        subjects: &[String],
    ) -> Result<RunPlan, PipelineError> {
        let applicator = default_applicator(config);
        build_plan(config, subjects, applicator.as_ref(), None)
    }

    pub async fn run(
        &self,
        config: &PipelineConfig,
        subjects: &[String],
        options: RunOptions,
    ) -> Result<PipelineRunResult, PipelineError> {
        let applicator = options
            .applicator
            .unwrap_or_else(|| default_applicator(config));
        let plan = build_plan(config, subjects, applicator.as_ref(), options.run_id)?;
        let dispatcher = Dispatcher::for_subjects(plan.subjects.len());
        let events = options.events;

        tracing::info!(
            run_id = %plan.run_id,
            units = plan.units.len(),
            n_procs = dispatcher.n_procs(),
            "workflow configured"
        );
        events.emit(RuntimeEventKind::Pipeline(PipelineEvent::Started {
            run_id: plan.run_id.clone(),
            unit_count: plan.units.len(),
            n_procs: dispatcher.n_procs(),
        }));

        let context = Arc::new(UnitContext {
            run_id: plan.run_id.clone(),
            applicator,
            collector: OutputCollector::new(config.sink_root(), plan.substitutions.clone()),
            layout: WorkflowLayout::new(config),
            events: events.clone(),
            dispatcher: dispatcher.clone(),
        });
        let units = dispatcher
            .run(plan.units, move |planned| {
                let context = Arc::clone(&context);
                async move { context.run_unit(planned).await }
            })
            .await?;

        let failed: Vec<&UnitReport> = units
            .iter()
            .filter(|report| report.status != NodeStatus::Success)
            .collect();
        let status = if failed.is_empty() {
            PipelineStatus::Success
        } else {
            PipelineStatus::Fail
        };

        match status {
            PipelineStatus::Success => {
                tracing::info!(run_id = %plan.run_id, units = units.len(), "workflow completed");
                events.emit(RuntimeEventKind::Pipeline(PipelineEvent::Completed {
                    run_id: plan.run_id.clone(),
                    unit_count: units.len(),
                }));
            }
            PipelineStatus::Fail => {
                let reason = failed
                    .iter()
                    .map(|report| report.unit.label())
                    .collect::<Vec<_>>()
                    .join(", ");
                tracing::error!(run_id = %plan.run_id, failed = failed.len(), "workflow finished with failed units: {reason}");
                events.emit(RuntimeEventKind::Pipeline(PipelineEvent::Failed {
                    run_id: plan.run_id.clone(),
                    failed_units: failed.len(),
                    reason: format!("failed units: {reason}"),
                }));
            }
        }

        Ok(PipelineRunResult {
            run_id: plan.run_id,
            status,
            n_procs: dispatcher.n_procs(),
            units,
        })
    }
}

fn default_applicator(config: &PipelineConfig) -> SharedTransformApplicator {
    Arc::new(AntsApplyTransforms::new(
        config.applicator.clone(),
        config.template.clone(),
    ))
}

fn build_plan(
    config: &PipelineConfig,
    subjects: &[String],
    applicator: &dyn TransformApplicator,
    run_id: Option<String>,
) -> Result<RunPlan, PipelineError> {
    let source = ParameterSource::new(subjects.iter().cloned(), &config.tasks, &config.fwhm)?;
    config.validate()?;

    let substitutions = SubstitutionTable::build(&source);
    substitutions.validate()?;

    let resolver = FileResolver::new(config)?;
    let layout = WorkflowLayout::new(config);
    let collector = OutputCollector::new(config.sink_root(), substitutions.clone());

    let mut units = Vec::with_capacity(source.unit_count());
    for unit in source.work_units() {
        let inputs = resolver.resolve(&unit)?;
        let anat = plan_application(
            applicator,
            &collector,
            &layout,
            &unit,
            Modality::Anat,
            &inputs,
        );
        let bold = plan_application(
            applicator,
            &collector,
            &layout,
            &unit,
            Modality::Bold,
            &inputs,
        );
        units.push(PlannedUnit {
            unit,
            inputs,
            anat,
            bold,
        });
    }

    ensure_unique_destinations(units.iter().flat_map(|planned| {
        [&planned.anat, &planned.bold].map(|application| {
            (
                format!("{} ({})", planned.unit, application.request.modality),
                application.destination.as_path(),
            )
        })
    }))?;

    Ok(RunPlan {
        run_id: run_id.unwrap_or_else(|| default_run_id(config, &source)),
        n_procs: Dispatcher::for_subjects(source.subjects().len()).n_procs(),
        subjects: subjects.to_vec(),
        units,
        substitutions,
    })
}

fn plan_application(
    applicator: &dyn TransformApplicator,
    collector: &OutputCollector,
    layout: &WorkflowLayout,
    unit: &WorkUnit,
    modality: Modality,
    inputs: &ResolvedInputs,
) -> PlannedApplication {
    let input_image = match modality {
        Modality::Anat => inputs.anat.clone(),
        Modality::Bold => inputs.bold.clone(),
    };
    let request = TransformRequest {
        unit: unit.clone(),
        modality,
        input_image,
        transform: inputs.transform.clone(),
        node_dir: layout.node_dir(unit, modality),
    };
    let output_image = applicator.output_image(&request);
    let file_name = output_image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    PlannedApplication {
        command_line: applicator.command_line(&request),
        destination: collector.destination(unit, modality, &file_name),
        output_image,
        request,
    }
}

/// `<workflow>-<first 12 hex of blake3 over the parameter space>`.
fn default_run_id(config: &PipelineConfig, source: &ParameterSource) -> String {
    let mut hasher = blake3::Hasher::new();
    for subject in source.subjects() {
        hasher.update(b"subject:");
        hasher.update(subject.as_str().as_bytes());
        hasher.update(b"\n");
    }
    for task in source.tasks() {
        hasher.update(b"task:");
        hasher.update(task.as_str().as_bytes());
        hasher.update(b"\n");
    }
    for width in source.widths() {
        hasher.update(format!("fwhm:{width}\n").as_bytes());
    }
    let digest = hasher.finalize().to_hex();
    format!("{}-{}", config.workflow_name, &digest.as_str()[..12])
}

struct UnitContext {
    run_id: String,
    applicator: SharedTransformApplicator,
    collector: OutputCollector,
    layout: WorkflowLayout,
    events: RuntimeEventSink,
    dispatcher: Dispatcher,
}

impl UnitContext {
    async fn run_unit(&self, planned: PlannedUnit) -> UnitReport {
        let label = planned.unit.label();
        tracing::info!(run_id = %self.run_id, unit = %label, "unit started");
        self.events.emit(RuntimeEventKind::Unit(UnitEvent::Started {
            run_id: self.run_id.clone(),
            unit: label.clone(),
        }));

        let (anat, bold) = tokio::join!(
            self.apply_stage(&planned.anat),
            self.apply_stage(&planned.bold)
        );
        let mut stages = vec![anat.0, bold.0];
        let mut outputs = BTreeMap::new();
        let mut failure_reason = None;

        match (anat.1, bold.1) {
            (Some(anat_image), Some(bold_image)) => {
                let (report, placed) = self
                    .datasink_stage(&planned.unit, [(Modality::Anat, anat_image), (Modality::Bold, bold_image)])
                    .await;
                if let Err(reason) = &placed {
                    failure_reason = Some(reason.clone());
                }
                stages.push(report);
                if let Ok(placed) = placed {
                    outputs = placed;
                }
            }
            _ => {
                failure_reason = stages
                    .iter()
                    .filter(|stage| stage.status == NodeStatus::Fail)
                    .filter_map(|stage| stage.notes.clone())
                    .next();
                stages.push(StageReport {
                    stage: DATASINK_STAGE.to_string(),
                    status: NodeStatus::Skipped,
                    duration_ms: 0,
                    notes: Some("upstream applicator failed".to_string()),
                });
            }
        }

        let status = if failure_reason.is_none() {
            NodeStatus::Success
        } else {
            NodeStatus::Fail
        };
        let report = UnitReport {
            unit: planned.unit,
            status,
            inputs: planned.inputs,
            stages,
            outputs,
            failure_reason,
        };
        self.write_status(&report).await;

        match &report.failure_reason {
            None => {
                tracing::info!(run_id = %self.run_id, unit = %label, "unit completed");
                self.events.emit(RuntimeEventKind::Unit(UnitEvent::Completed {
                    run_id: self.run_id.clone(),
                    unit: label,
                    outputs: report
                        .outputs
                        .values()
                        .map(|path| path.display().to_string())
                        .collect(),
                }));
            }
            Some(reason) => {
                tracing::error!(run_id = %self.run_id, unit = %label, "unit failed: {reason}");
                self.events.emit(RuntimeEventKind::Unit(UnitEvent::Failed {
                    run_id: self.run_id.clone(),
                    unit: label,
                    reason: reason.clone(),
                }));
            }
        }
        report
    }

    async fn apply_stage(&self, planned: &PlannedApplication) -> (StageReport, Option<PathBuf>) {
        let stage = planned.request.stage();
        let unit = planned.request.unit.label();
        self.events.emit(RuntimeEventKind::Stage(StageEvent::Started {
            run_id: self.run_id.clone(),
            unit: unit.clone(),
            stage: stage.to_string(),
        }));

        // One slot per tool process; a unit itself holds none while it waits.
        let started = Instant::now();
        let outcome = match self.dispatcher.slot().await {
            Ok(_slot) => self.applicator.apply(&planned.request).await,
            Err(error) => Err(error),
        };
        match outcome {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis();
                self.events.emit(RuntimeEventKind::Stage(StageEvent::Completed {
                    run_id: self.run_id.clone(),
                    unit,
                    stage: stage.to_string(),
                    duration_ms,
                }));
                (
                    StageReport {
                        stage: stage.to_string(),
                        status: NodeStatus::Success,
                        duration_ms,
                        notes: None,
                    },
                    Some(output.output_image),
                )
            }
            Err(error) => {
                let reason = error.to_string();
                tracing::warn!(run_id = %self.run_id, unit = %unit, stage, "stage failed: {reason}");
                self.events.emit(RuntimeEventKind::Stage(StageEvent::Failed {
                    run_id: self.run_id.clone(),
                    unit,
                    stage: stage.to_string(),
                    reason: reason.clone(),
                }));
                (
                    StageReport {
                        stage: stage.to_string(),
                        status: NodeStatus::Fail,
                        duration_ms: started.elapsed().as_millis(),
                        notes: Some(reason),
                    },
                    None,
                )
            }
        }
    }

    async fn datasink_stage(
        &self,
        unit: &WorkUnit,
        produced: [(Modality, PathBuf); 2],
    ) -> (StageReport, Result<BTreeMap<Modality, PathBuf>, String>) {
        let label = unit.label();
        self.events.emit(RuntimeEventKind::Stage(StageEvent::Started {
            run_id: self.run_id.clone(),
            unit: label.clone(),
            stage: DATASINK_STAGE.to_string(),
        }));

        let started = Instant::now();
        let mut placed = BTreeMap::new();
        for (modality, image) in produced {
            match self.collector.place(unit, modality, &image).await {
                Ok(destination) => {
                    placed.insert(modality, destination);
                }
                Err(error) => {
                    let reason = error.to_string();
                    self.events.emit(RuntimeEventKind::Stage(StageEvent::Failed {
                        run_id: self.run_id.clone(),
                        unit: label,
                        stage: DATASINK_STAGE.to_string(),
                        reason: reason.clone(),
                    }));
                    return (
                        StageReport {
                            stage: DATASINK_STAGE.to_string(),
                            status: NodeStatus::Fail,
                            duration_ms: started.elapsed().as_millis(),
                            notes: Some(reason.clone()),
                        },
                        Err(reason),
                    );
                }
            }
        }

        let duration_ms = started.elapsed().as_millis();
        self.events.emit(RuntimeEventKind::Stage(StageEvent::Completed {
            run_id: self.run_id.clone(),
            unit: label,
            stage: DATASINK_STAGE.to_string(),
            duration_ms,
        }));
        (
            StageReport {
                stage: DATASINK_STAGE.to_string(),
                status: NodeStatus::Success,
                duration_ms,
                notes: None,
            },
            Ok(placed),
        )
    }

    async fn write_status(&self, report: &UnitReport) {
        let path = self.layout.status_path(&report.unit);
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let json = serde_json::to_vec_pretty(report).map_err(std::io::Error::other)?;
            tokio::fs::write(&path, json).await
        }
        .await;
        if let Err(error) = result {
            tracing::warn!(path = %path.display(), "failed writing unit status: {error}");
        }
    }
}
