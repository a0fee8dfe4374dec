use clap::{ArgAction, Parser};
use normflow_pipeline::{
    PipelineConfig, PipelineError, PipelineEvent, PipelineRunResult, PipelineRunner,
    PipelineStatus, RunOptions, RunPlan, RuntimeEvent, RuntimeEventKind, RuntimeEventSink,
    StageEvent, UnitEvent, runtime_event_channel,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "normflow-cli")]
#[command(about = "Normalize BOLD and T1w volumes into template space with antsApplyTransforms")]
struct Cli {
    /// Subject IDs to process.
    #[arg(required = true, value_name = "SUBJECT_ID")]
    subjects: Vec<String>,
    /// JSON pipeline config; missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    experiment_dir: Option<PathBuf>,
    /// Path or name of the antsApplyTransforms executable.
    #[arg(long)]
    ants_program: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    /// Print the resolved plan without launching anything.
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// With --dry-run, print the plan as JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let _ = dotenvy::dotenv();
    init_tracing(cli.verbose);

    let result = if cli.dry_run {
        plan_command(&cli)
    } else {
        run_command(&cli).await
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "normflow_pipeline=debug,normflow_cli=debug"
    } else {
        "normflow_pipeline=info,normflow_cli=info"
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn build_config(cli: &Cli) -> Result<PipelineConfig, PipelineError> {
    let mut config = match cli.config.as_deref() {
        Some(path) => PipelineConfig::load_from_path(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = cli.experiment_dir.as_ref() {
        config.experiment_dir = dir.clone();
    }
    if let Some(program) = cli.ants_program.as_ref() {
        config.applicator.program = program.clone();
    }
    config.validate()?;
    tracing::debug!(
        experiment_dir = %config.experiment_dir.display(),
        template = %config.template.display(),
        program = %config.applicator.program,
        "pipeline config ready"
    );
    Ok(config)
}

fn plan_command(cli: &Cli) -> Result<ExitCode, String> {
    let config = build_config(cli).map_err(|error| error.to_string())?;
    let mut plan = PipelineRunner
        .plan(&config, &cli.subjects)
        .map_err(|error| error.to_string())?;
    if let Some(run_id) = cli.run_id.as_ref() {
        plan.run_id = run_id.clone();
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&plan).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        print_plan(&plan);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_command(cli: &Cli) -> Result<ExitCode, String> {
    let config = build_config(cli).map_err(|error| error.to_string())?;
    let (events, event_task) = event_stream(!cli.no_stream_events, cli.event_json);

    let run_result = PipelineRunner
        .run(
            &config,
            &cli.subjects,
            RunOptions {
                run_id: cli.run_id.clone(),
                events,
                ..RunOptions::default()
            },
        )
        .await
        .map_err(|error| error.to_string());

    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    let run_result = run_result?;
    print_run_summary(&run_result);
    Ok(exit_code_for_status(run_result.status))
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RuntimeEventSink::default(), None);
    }

    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_label(&event.kind)
    );
}

fn event_label(kind: &RuntimeEventKind) -> String {
    match kind {
        RuntimeEventKind::Pipeline(PipelineEvent::Started {
            unit_count, n_procs, ..
        }) => format!("pipeline started units={unit_count} n_procs={n_procs}"),
        RuntimeEventKind::Pipeline(PipelineEvent::Completed { .. }) => {
            "pipeline completed".to_string()
        }
        RuntimeEventKind::Pipeline(PipelineEvent::Failed { reason, .. }) => {
            format!("pipeline failed: {reason}")
        }
        RuntimeEventKind::Unit(UnitEvent::Started { unit, .. }) => format!("unit {unit} started"),
        RuntimeEventKind::Unit(UnitEvent::Completed { unit, .. }) => {
            format!("unit {unit} completed")
        }
        RuntimeEventKind::Unit(UnitEvent::Failed { unit, reason, .. }) => {
            format!("unit {unit} failed: {reason}")
        }
        RuntimeEventKind::Stage(StageEvent::Started { unit, stage, .. }) => {
            format!("stage {stage} started for {unit}")
        }
        RuntimeEventKind::Stage(StageEvent::Completed {
            unit,
            stage,
            duration_ms,
            ..
        }) => format!("stage {stage} completed for {unit} in {duration_ms}ms"),
        RuntimeEventKind::Stage(StageEvent::Failed {
            unit,
            stage,
            reason,
            ..
        }) => format!("stage {stage} failed for {unit}: {reason}"),
    }
}

fn print_plan(plan: &RunPlan) {
    println!("run_id: {}", plan.run_id);
    println!("n_procs: {}", plan.n_procs);
    println!("units: {}", plan.units.len());
    println!("substitutions: {}", plan.substitutions.len());
    for planned in &plan.units {
        println!("[{}]", planned.unit);
        for application in [&planned.anat, &planned.bold] {
            println!(
                "  {}: {}",
                application.request.stage(),
                application.command_line.join(" ")
            );
            println!("    -> {}", application.destination.display());
        }
    }
}

fn print_run_summary(result: &PipelineRunResult) {
    println!("run_id: {}", result.run_id);
    println!("status: {}", result.status.as_str());
    println!("n_procs: {}", result.n_procs);
    println!("completed_units: {}", result.completed_units().count());
    for report in result.failed_units() {
        println!(
            "failed_unit: {} ({})",
            report.unit,
            report.failure_reason.as_deref().unwrap_or("<unknown>")
        );
    }
}

fn exit_code_for_status(status: PipelineStatus) -> ExitCode {
    match status {
        PipelineStatus::Success => ExitCode::SUCCESS,
        PipelineStatus::Fail => ExitCode::from(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_expected_both_crates_at_level() {
        assert_eq!(
            default_directives(false),
            "normflow_pipeline=info,normflow_cli=info"
        );
        assert_eq!(
            default_directives(true),
            "normflow_pipeline=debug,normflow_cli=debug"
        );
        assert!(EnvFilter::try_new(default_directives(false)).is_ok());
    }

    #[test]
    fn template_flag_expected_rejected() {
        let parsed = Cli::try_parse_from(["normflow-cli", "01", "--template", "/tmp/t.nii.gz"]);
        assert!(parsed.is_err());
    }
}
