use crate::{PipelineConfig, PipelineError, WorkUnit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("valid regex"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    SubjectId,
    TaskName,
    FwhmId,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "subject_id" => Some(Self::SubjectId),
            "task_name" => Some(Self::TaskName),
            "fwhm_id" => Some(Self::FwhmId),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Field),
}

/// A file path pattern with `{subject_id}`, `{task_name}` and `{fwhm_id}` slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        if raw.trim().is_empty() {
            return Err(PipelineError::Template("path template cannot be empty".to_string()));
        }

        let mut segments = Vec::new();
        let mut cursor = 0;
        for captures in PLACEHOLDER.captures_iter(raw) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            push_literal(&mut segments, raw, &raw[cursor..whole.start()])?;
            let name = &captures[1];
            let field = Field::from_name(name).ok_or_else(|| {
                PipelineError::Template(format!(
                    "unknown placeholder '{{{name}}}' in template '{raw}'"
                ))
            })?;
            segments.push(Segment::Placeholder(field));
            cursor = whole.end();
        }
        push_literal(&mut segments, raw, &raw[cursor..])?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the template's own text carries glob metacharacters.
    /// Substituted values never make a template a glob.
    pub fn is_glob(&self) -> bool {
        self.segments.iter().any(|segment| {
            matches!(segment, Segment::Literal(text) if text.contains(GLOB_CHARS))
        })
    }

    pub fn render(&self, unit: &WorkUnit) -> String {
        self.render_with(unit, |value| value.to_string())
    }

    /// Like `render`, with every substituted value escaped so it matches
    /// itself literally inside a glob pattern.
    pub fn render_pattern(&self, unit: &WorkUnit) -> String {
        self.render_with(unit, glob::Pattern::escape)
    }

    fn render_with(&self, unit: &WorkUnit, value: impl Fn(&str) -> String) -> String {
        let mut out = String::with_capacity(self.raw.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(Field::SubjectId) => {
                    out.push_str(&value(unit.subject.as_str()))
                }
                Segment::Placeholder(Field::TaskName) => out.push_str(&value(unit.task.as_str())),
                Segment::Placeholder(Field::FwhmId) => {
                    out.push_str(&value(&unit.fwhm.to_string()))
                }
            }
        }
        out
    }
}

const GLOB_CHARS: [char; 3] = ['*', '?', '['];

fn push_literal(
    segments: &mut Vec<Segment>,
    raw: &str,
    literal: &str,
) -> Result<(), PipelineError> {
    if literal.contains(['{', '}']) {
        return Err(PipelineError::Template(format!(
            "unbalanced brace in template '{raw}'"
        )));
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal.to_string()));
    }
    Ok(())
}

/// Joins `relative` onto `base`, dropping empty segments. A leading `/`
/// makes `relative` absolute and `base` is ignored.
pub fn join_collapsed(base: &Path, relative: &str) -> PathBuf {
    let mut out = if relative.starts_with('/') {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    for part in relative.split('/').filter(|part| !part.is_empty()) {
        out.push(part);
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInputs {
    pub bold: PathBuf,
    pub anat: PathBuf,
    pub transform: PathBuf,
}

#[derive(Clone, Debug)]
pub struct FileResolver {
    base_directory: PathBuf,
    bold: PathTemplate,
    anat: PathTemplate,
    transform: PathTemplate,
}

impl FileResolver {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            base_directory: config.experiment_dir.clone(),
            bold: PathTemplate::parse(&config.templates.bold)?,
            anat: PathTemplate::parse(&config.templates.anat)?,
            transform: PathTemplate::parse(&config.templates.transform)?,
        })
    }

    /// Literal templates are returned as-is; only templates written as glob
    /// patterns touch the filesystem.
    pub fn resolve(&self, unit: &WorkUnit) -> Result<ResolvedInputs, PipelineError> {
        Ok(ResolvedInputs {
            bold: self.resolve_one("bold", &self.bold, unit)?,
            anat: self.resolve_one("anat", &self.anat, unit)?,
            transform: self.resolve_one("transform", &self.transform, unit)?,
        })
    }

    fn resolve_one(
        &self,
        field: &str,
        template: &PathTemplate,
        unit: &WorkUnit,
    ) -> Result<PathBuf, PipelineError> {
        if !template.is_glob() {
            return Ok(join_collapsed(&self.base_directory, &template.render(unit)));
        }

        let base = glob::Pattern::escape(&self.base_directory.to_string_lossy());
        let pattern = join_collapsed(Path::new(&base), &template.render_pattern(unit))
            .to_string_lossy()
            .into_owned();
        let mut matches: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|error| {
                PipelineError::Template(format!("invalid glob pattern '{pattern}': {error}"))
            })?
            .filter_map(Result::ok)
            .collect();
        matches.sort();
        tracing::debug!(unit = %unit, field, pattern = %pattern, matches = matches.len(), "expanded glob template");
        matches.into_iter().next().ok_or_else(|| {
            PipelineError::MissingInput(format!(
                "no file matched {field} pattern '{pattern}' for {unit}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParameterSource;
    use std::fs;
    use tempfile::TempDir;

    fn unit(subject: &str, fwhm: u32) -> WorkUnit {
        ParameterSource::new([subject], &["empathy".to_string()], &[fwhm])
            .expect("source should build")
            .work_units()
            .remove(0)
    }

    #[test]
    fn resolve_default_templates_expected_fully_substituted_paths() {
        let resolver = FileResolver::new(&PipelineConfig::default()).expect("resolver");
        let inputs = resolver.resolve(&unit("01", 4)).expect("resolve");

        assert_eq!(
            inputs.bold,
            PathBuf::from(
                "/data/wellbeing_analysis/datasink/preproc/sub-01/task-empathy/fwhm-4_sasub-01_task-empathy_bold.nii"
            )
        );
        assert_eq!(
            inputs.anat,
            PathBuf::from(
                "/data/wellbeing_analysis/datasink/preproc/sub-01/task-empathy/sub-01_T1w_brain.nii.gz"
            )
        );
        assert_eq!(
            inputs.transform,
            PathBuf::from("/data/wellbeing_analysis/datasink/antsreg/sub-01/transformComposite.h5")
        );
        for path in [&inputs.bold, &inputs.anat, &inputs.transform] {
            let text = path.to_string_lossy();
            assert!(!text.contains("//"), "double slash in {text}");
            assert!(!text.contains('{') && !text.contains('}'), "placeholder left in {text}");
        }
    }

    #[test]
    fn resolve_missing_literal_file_expected_no_error() {
        let temp = TempDir::new().expect("tempdir should create");
        let config = PipelineConfig {
            experiment_dir: temp.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let resolver = FileResolver::new(&config).expect("resolver");
        let inputs = resolver.resolve(&unit("02", 8)).expect("resolve");
        assert!(!inputs.bold.exists());
        assert!(inputs.bold.starts_with(temp.path()));
    }

    #[test]
    fn join_collapsed_expected_empty_segments_dropped() {
        assert_eq!(
            join_collapsed(Path::new("/data"), "datasink//preproc/"),
            PathBuf::from("/data/datasink/preproc")
        );
        assert_eq!(
            join_collapsed(Path::new("/data"), "/abs//file.nii"),
            PathBuf::from("/abs/file.nii")
        );
    }

    #[test]
    fn parse_unclosed_placeholder_expected_template_error() {
        let error = PathTemplate::parse("sub-{subject_id/anat.nii").expect_err("should fail");
        assert!(matches!(error, PipelineError::Template(_)));
    }

    #[test]
    fn resolve_glob_template_expected_first_sorted_match() {
        let temp = TempDir::new().expect("tempdir should create");
        let dir = temp.path().join("reg").join("sub-01");
        fs::create_dir_all(&dir).expect("dir should create");
        fs::write(dir.join("b_Composite.h5"), b"b").expect("write");
        fs::write(dir.join("a_Composite.h5"), b"a").expect("write");

        let mut config = PipelineConfig {
            experiment_dir: temp.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        config.templates.transform = "reg/sub-{subject_id}/*_Composite.h5".to_string();
        let resolver = FileResolver::new(&config).expect("resolver");

        let inputs = resolver.resolve(&unit("01", 4)).expect("resolve");
        assert_eq!(inputs.transform, dir.join("a_Composite.h5"));

        let error = resolver
            .resolve(&unit("02", 4))
            .expect_err("no match should fail");
        assert!(matches!(error, PipelineError::MissingInput(_)));
    }

    #[test]
    fn resolve_bracketed_experiment_dir_and_subject_expected_literal_paths() {
        let config = PipelineConfig {
            experiment_dir: PathBuf::from("/data/study[2024]"),
            ..PipelineConfig::default()
        };
        let resolver = FileResolver::new(&config).expect("resolver");

        let inputs = resolver.resolve(&unit("[01]", 4)).expect("resolve");
        assert_eq!(
            inputs.bold,
            PathBuf::from(
                "/data/study[2024]/datasink/preproc/sub-[01]/task-empathy/fwhm-4_sasub-[01]_task-empathy_bold.nii"
            )
        );
        assert_eq!(
            inputs.transform,
            PathBuf::from("/data/study[2024]/datasink/antsreg/sub-[01]/transformComposite.h5")
        );
    }

    #[test]
    fn resolve_glob_template_with_bracketed_dir_and_subject_expected_match() {
        let temp = TempDir::new().expect("tempdir should create");
        let experiment = temp.path().join("study[2024]");
        let dir = experiment.join("reg").join("sub-[01]");
        fs::create_dir_all(&dir).expect("dir should create");
        fs::write(dir.join("x_Composite.h5"), b"x").expect("write");

        let mut config = PipelineConfig {
            experiment_dir: experiment,
            ..PipelineConfig::default()
        };
        config.templates.transform = "reg/sub-{subject_id}/*_Composite.h5".to_string();
        let resolver = FileResolver::new(&config).expect("resolver");

        let inputs = resolver.resolve(&unit("[01]", 4)).expect("resolve");
        assert_eq!(inputs.transform, dir.join("x_Composite.h5"));
    }

    #[test]
    fn is_glob_expected_only_template_text_counts() {
        assert!(!PathTemplate::parse("sub-{subject_id}/a.nii").expect("parse").is_glob());
        assert!(PathTemplate::parse("sub-{subject_id}/*.h5").expect("parse").is_glob());
    }
}
