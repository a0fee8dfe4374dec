use crate::{ApplyTransformsSettings, Modality, PipelineError, WorkUnit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

pub const COMMAND_FILE_NAME: &str = "command.txt";
pub const STDOUT_FILE_NAME: &str = "stdout.log";
pub const STDERR_FILE_NAME: &str = "stderr.log";
const STDERR_TAIL_LINES: usize = 20;

/// Multi-part extensions kept whole when deriving output names.
const COMPOUND_EXTENSIONS: [&str; 3] = [".nii.gz", ".tar.gz", ".BRIK.gz"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub unit: WorkUnit,
    pub modality: Modality,
    pub input_image: PathBuf,
    pub transform: PathBuf,
    pub node_dir: PathBuf,
}

impl TransformRequest {
    pub fn stage(&self) -> &'static str {
        self.modality.node_name()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub output_image: PathBuf,
    pub exit_code: i32,
    pub duration_ms: u128,
}

#[async_trait]
pub trait TransformApplicator: Send + Sync {
    /// Planned output location, known before the tool runs.
    fn output_image(&self, request: &TransformRequest) -> PathBuf;

    fn command_line(&self, request: &TransformRequest) -> Vec<String>;

    async fn apply(&self, request: &TransformRequest) -> Result<TransformOutput, PipelineError>;
}

pub type SharedTransformApplicator = Arc<dyn TransformApplicator>;

/// Resamples a volume into template space with `antsApplyTransforms`.
#[derive(Clone, Debug)]
pub struct AntsApplyTransforms {
    settings: ApplyTransformsSettings,
    reference_image: PathBuf,
}

impl AntsApplyTransforms {
    pub fn new(settings: ApplyTransformsSettings, reference_image: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            reference_image: reference_image.into(),
        }
    }

    pub fn settings(&self) -> &ApplyTransformsSettings {
        &self.settings
    }

    fn args(&self, request: &TransformRequest) -> Vec<String> {
        let mut args = vec![
            "--default-value".to_string(),
            self.settings.default_value.to_string(),
        ];
        if self.settings.float_precision {
            args.push("--float".to_string());
            args.push("1".to_string());
        }
        args.extend([
            "--input-image-type".to_string(),
            self.settings.input_image_type.to_string(),
            "--input".to_string(),
            request.input_image.display().to_string(),
            "--interpolation".to_string(),
            self.settings.interpolation.as_str().to_string(),
            "--output".to_string(),
            self.output_image(request).display().to_string(),
            "--reference-image".to_string(),
            self.reference_image.display().to_string(),
            "--transform".to_string(),
            format!(
                "[ {}, {} ]",
                request.transform.display(),
                u8::from(self.settings.invert_transform)
            ),
        ]);
        args
    }
}

#[async_trait]
impl TransformApplicator for AntsApplyTransforms {
    fn output_image(&self, request: &TransformRequest) -> PathBuf {
        request.node_dir.join(output_file_name(
            &request.input_image,
            &self.settings.output_postfix,
        ))
    }

    fn command_line(&self, request: &TransformRequest) -> Vec<String> {
        let mut argv = vec![self.settings.program.clone()];
        argv.extend(self.args(request));
        argv
    }

    async fn apply(&self, request: &TransformRequest) -> Result<TransformOutput, PipelineError> {
        tokio::fs::create_dir_all(&request.node_dir).await?;
        let command_line = self.command_line(request);
        tokio::fs::write(
            request.node_dir.join(COMMAND_FILE_NAME),
            format!("{}\n", command_line.join(" ")),
        )
        .await?;

        tracing::debug!(
            unit = %request.unit,
            stage = request.stage(),
            command = %command_line.join(" "),
            "launching transform applicator"
        );
        let started = Instant::now();
        let output = Command::new(&self.settings.program)
            .args(&command_line[1..])
            .env(
                "ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS",
                self.settings.num_threads.to_string(),
            )
            .current_dir(&request.node_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| PipelineError::ToolFailed {
                unit: request.unit.label(),
                stage: request.stage().to_string(),
                exit_code: None,
                stderr_tail: format!(
                    "failed to launch '{}': {error}",
                    self.settings.program
                ),
            })?;
        let duration_ms = started.elapsed().as_millis();

        tokio::fs::write(request.node_dir.join(STDOUT_FILE_NAME), &output.stdout).await?;
        tokio::fs::write(request.node_dir.join(STDERR_FILE_NAME), &output.stderr).await?;

        if !output.status.success() {
            return Err(PipelineError::ToolFailed {
                unit: request.unit.label(),
                stage: request.stage().to_string(),
                exit_code: output.status.code(),
                stderr_tail: tail_lines(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
            });
        }

        Ok(TransformOutput {
            output_image: self.output_image(request),
            exit_code: output.status.code().unwrap_or_default(),
            duration_ms,
        })
    }
}

/// `<stem><postfix><ext>`, treating `.nii.gz` and friends as one extension.
pub fn output_file_name(input: &Path, postfix: &str) -> String {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = split_image_name(&name);
    format!("{stem}{postfix}{ext}")
}

fn split_image_name(name: &str) -> (&str, &str) {
    for compound in COMPOUND_EXTENSIONS {
        if let Some(stem) = name.strip_suffix(compound) {
            if !stem.is_empty() {
                return (stem, compound);
            }
        }
    }
    match name.rfind('.') {
        Some(index) if index > 0 => name.split_at(index),
        _ => (name, ""),
    }
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let tail = lines[start..].join("\n");
    if tail.trim().is_empty() {
        "no stderr output".to_string()
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParameterSource;

    fn request(modality: Modality, input: &str) -> TransformRequest {
        let unit = ParameterSource::new(["01"], &["empathy".to_string()], &[4])
            .expect("source")
            .work_units()
            .remove(0);
        TransformRequest {
            unit,
            modality,
            input_image: PathBuf::from(input),
            transform: PathBuf::from("/data/antsreg/sub-01/transformComposite.h5"),
            node_dir: PathBuf::from("/work/node"),
        }
    }

    #[test]
    fn output_file_name_expected_compound_extension_preserved() {
        assert_eq!(
            output_file_name(Path::new("/x/sub-01_T1w_brain.nii.gz"), "_trans"),
            "sub-01_T1w_brain_trans.nii.gz"
        );
        assert_eq!(
            output_file_name(Path::new("/x/fwhm-4_sasub-01_task-empathy_bold.nii"), "_trans"),
            "fwhm-4_sasub-01_task-empathy_bold_trans.nii"
        );
        assert_eq!(output_file_name(Path::new("/x/volume"), "_trans"), "volume_trans");
    }

    #[test]
    fn command_line_default_settings_expected_fixed_flags() {
        let applicator = AntsApplyTransforms::new(
            ApplyTransformsSettings::default(),
            "/templates/1mm_T1.nii.gz",
        );
        let argv = applicator.command_line(&request(Modality::Bold, "/in/bold.nii"));

        assert_eq!(
            argv,
            vec![
                "antsApplyTransforms",
                "--default-value",
                "0",
                "--float",
                "1",
                "--input-image-type",
                "3",
                "--input",
                "/in/bold.nii",
                "--interpolation",
                "BSpline",
                "--output",
                "/work/node/bold_trans.nii",
                "--reference-image",
                "/templates/1mm_T1.nii.gz",
                "--transform",
                "[ /data/antsreg/sub-01/transformComposite.h5, 0 ]",
            ]
        );
    }

    #[test]
    fn command_line_inverted_without_float_expected_flag_changes() {
        let settings = ApplyTransformsSettings {
            invert_transform: true,
            float_precision: false,
            ..ApplyTransformsSettings::default()
        };
        let applicator = AntsApplyTransforms::new(settings, "/t.nii.gz");
        let argv = applicator.command_line(&request(Modality::Anat, "/in/anat.nii.gz"));
        assert!(!argv.iter().any(|arg| arg == "--float"));
        assert_eq!(
            argv.last().map(String::as_str),
            Some("[ /data/antsreg/sub-01/transformComposite.h5, 1 ]")
        );
    }

    #[test]
    fn tail_lines_expected_last_lines_only() {
        let text = (1..=30).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 3);
        assert_eq!(tail, "28\n29\n30");
        assert_eq!(tail_lines("  \n", 3), "no stderr output");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn apply_missing_program_expected_tool_failed() {
        let temp = tempfile::TempDir::new().expect("tempdir should create");
        let settings = ApplyTransformsSettings {
            program: temp
                .path()
                .join("does-not-exist")
                .display()
                .to_string(),
            ..ApplyTransformsSettings::default()
        };
        let applicator = AntsApplyTransforms::new(settings, "/t.nii.gz");
        let mut req = request(Modality::Anat, "/in/anat.nii.gz");
        req.node_dir = temp.path().join("node");

        let error = applicator.apply(&req).await.expect_err("spawn should fail");
        match error {
            PipelineError::ToolFailed { stage, exit_code, .. } => {
                assert_eq!(stage, "apply_norm_anat");
                assert_eq!(exit_code, None);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(req.node_dir.join(COMMAND_FILE_NAME).exists());
    }
}
