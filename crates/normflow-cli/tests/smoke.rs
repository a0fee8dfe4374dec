use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn run_cli(args: &[&str], cwd: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_normflow-cli"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .output()
        .expect("cli process should start")
}

fn describe(output: &std::process::Output) -> String {
    format!(
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn no_subjects_expected_usage_error_before_any_work() {
    let temp = TempDir::new().expect("tempdir should create");
    let experiment = temp.path().to_str().expect("tempdir should be utf8");

    let output = run_cli(&["--experiment-dir", experiment], temp.path());

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("SUBJECT_ID"), "{}", describe(&output));
    assert!(!temp.path().join("workingdir").exists());
    assert!(!temp.path().join("datasink").exists());
}

#[test]
fn template_override_flag_expected_usage_error() {
    let temp = TempDir::new().expect("tempdir should create");

    let output = run_cli(&["01", "--template", "/tmp/other.nii.gz", "--dry-run"], temp.path());

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(output.stdout.is_empty(), "{}", describe(&output));
}

#[test]
fn dry_run_json_expected_full_plan_without_side_effects() {
    let temp = TempDir::new().expect("tempdir should create");
    let experiment = temp.path().to_str().expect("tempdir should be utf8");

    let output = run_cli(
        &[
            "01",
            "02",
            "--experiment-dir",
            experiment,
            "--dry-run",
            "--json",
        ],
        temp.path(),
    );
    assert!(output.status.success(), "{}", describe(&output));

    let plan: Value = serde_json::from_slice(&output.stdout).expect("plan should be json");
    assert_eq!(plan["n_procs"], 6);
    assert_eq!(plan["units"].as_array().map(Vec::len), Some(4));
    assert_eq!(
        plan["substitutions"]["entries"].as_array().map(Vec::len),
        Some(8)
    );
    assert_eq!(
        plan["units"][0]["anat"]["command_line"][0],
        "antsApplyTransforms"
    );
    assert!(!temp.path().join("workingdir").exists());
}

#[test]
fn dry_run_text_expected_commands_and_destinations() {
    let temp = TempDir::new().expect("tempdir should create");
    let experiment = temp.path().to_str().expect("tempdir should be utf8");

    let output = run_cli(
        &["07", "--experiment-dir", experiment, "--dry-run", "--run-id", "dry"],
        temp.path(),
    );
    assert!(output.status.success(), "{}", describe(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run_id: dry"));
    assert!(stdout.contains("n_procs: 3"));
    assert!(stdout.contains("[sub-07/task-empathy/fwhm-8]"));
    assert!(stdout.contains("--interpolation BSpline"));
    assert!(stdout.contains("datasink/sub-07/bold/task-empathy/fwhm-4_sasub-07_task-empathy_bold_trans.nii"));
}

#[cfg(unix)]
mod with_stub_tool {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const SUCCEEDING_STUB: &str = r#"#!/bin/sh
out=""
while [ "$#" -gt 0 ]; do
  if [ "$1" = "--output" ]; then
    out="$2"
  fi
  shift
done
printf 'resampled\n' > "$out"
echo "threads=$ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS"
"#;

    const FAILING_STUB: &str = "#!/bin/sh\necho 'Transform file not found' >&2\nexit 1\n";

    fn write_stub(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-antsApplyTransforms");
        std::fs::write(&path, body).expect("stub should write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("stub should be executable");
        path.to_str().expect("stub path should be utf8").to_string()
    }

    #[test]
    fn run_with_stub_tool_expected_outputs_in_sink_tree() {
        let temp = TempDir::new().expect("tempdir should create");
        let experiment = temp.path().join("study");
        let stub = write_stub(temp.path(), SUCCEEDING_STUB);

        let output = run_cli(
            &[
                "01",
                "--experiment-dir",
                experiment.to_str().expect("utf8"),
                "--ants-program",
                &stub,
                "--event-json",
            ],
            temp.path(),
        );
        assert!(output.status.success(), "{}", describe(&output));

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("\"category\":\"pipeline\""));
        assert!(stdout.contains("status: success"));
        assert!(stdout.contains("completed_units: 2"));

        for fwhm in [4, 8] {
            assert!(
                experiment
                    .join(format!(
                        "datasink/sub-01/bold/task-empathy/fwhm-{fwhm}_sasub-01_task-empathy_bold_trans.nii"
                    ))
                    .exists()
            );
            assert!(
                experiment
                    .join(format!(
                        "datasink/sub-01/anat/task-empathy/fwhm-{fwhm}/sub-01_T1w_brain_trans.nii.gz"
                    ))
                    .exists()
            );
        }

        let node_dir = experiment.join(
            "workingdir/antsflow/_fwhm_id_4_subject_id_01_task_name_empathy/apply_norm_bold/mapflow/_apply_norm_bold0",
        );
        let stdout_log =
            std::fs::read_to_string(node_dir.join("stdout.log")).expect("stdout.log should exist");
        assert_eq!(stdout_log.trim(), "threads=8");
        let command =
            std::fs::read_to_string(node_dir.join("command.txt")).expect("command.txt should exist");
        assert!(command.contains("--transform ["));
    }

    #[test]
    fn run_with_failing_tool_expected_fail_status_exit_code() {
        let temp = TempDir::new().expect("tempdir should create");
        let experiment = temp.path().join("study");
        let stub = write_stub(temp.path(), FAILING_STUB);

        let output = run_cli(
            &[
                "01",
                "--experiment-dir",
                experiment.to_str().expect("utf8"),
                "--ants-program",
                &stub,
                "--no-stream-events",
            ],
            temp.path(),
        );

        assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("status: fail"));
        assert!(stdout.contains("Transform file not found"));
        assert!(!experiment.join("datasink").exists());
    }
}
