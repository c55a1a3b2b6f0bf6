//! CLI command definitions for multiscale-atlas.
//!
//! `run` processes one subject; `batch` drives a whole cohort through the
//! worker pool; `resolve` and `resolve-multimodal` build cohort inputs from
//! a BIDS dataset.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use serde::Serialize;
use tracing::{info, warn};

use crate::cohort::{
    read_cohort_csv, resolve_anatomical, resolve_multimodal, write_reconall_csv,
    AnatomicalQuery, BidsDirectoryIndex, DatasetIndex, InMemoryIndex, Modality,
};
use crate::environment::{ToolkitEnvironment, DEFAULT_ENV_FILE};
use crate::pipeline::{CohortOrchestrator, CohortReport, PipelineConfig, Subject};
use crate::runner::{ProcessInvoker, RecordingInvoker, ToolInvocation, ToolInvoker};

/// Default worker pool size for `batch`.
const DEFAULT_BATCH_JOBS: usize = 4;

/// Lausanne 2018 multi-scale parcellation pipeline.
#[derive(Parser)]
#[command(name = "multiscale-atlas")]
#[command(about = "Run FreeSurfer reconstruction and the Lausanne 2018 multi-scale parcellation")]
#[command(version)]
#[command(
    long_about = "multiscale-atlas runs recon-all for a subject, maps the five Lausanne 2018 scales onto it, computes per-scale statistics and volumes, and moves the finished tree to its destination.\n\nExample usage:\n  multiscale-atlas run --t1 sub-01_T1w.nii.gz -s sub-01 -o ./results\n  multiscale-atlas resolve --bids /data/bids --out fs_reconall.csv\n  multiscale-atlas batch --cohort fs_reconall.csv --output-root ./results --jobs 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process one subject: reconstruction, all scales, then finalization.
    Run(RunArgs),

    /// Process every subject listed in a cohort CSV.
    Batch(BatchArgs),

    /// Resolve one T1-weighted image per subject and write the cohort CSV.
    Resolve(ResolveArgs),

    /// Resolve per-subject multi-file acquisitions (diffusion or field maps).
    #[command(name = "resolve-multimodal")]
    ResolveMultimodal(MultimodalArgs),
}

/// Toolkit and execution options shared by `run` and `batch`.
#[derive(Args, Debug, Clone)]
pub struct ToolkitArgs {
    /// Toolkit environment file (JSON or YAML). Defaults to
    /// ./setup_environment.json when present.
    #[arg(long, env = "MULTISCALE_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// Thread hint passed to recon-all and mri_aparc2aseg.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Population-average subject holding the atlas annotations.
    #[arg(long)]
    pub source_subject: Option<String>,

    /// Atlas prefix used in annotation and output names.
    #[arg(long)]
    pub atlas: Option<String>,

    /// Print the commands that would run instead of running them.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `multiscale-atlas run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input T1-weighted image.
    #[arg(long = "t1", value_name = "PATH")]
    pub t1: PathBuf,

    /// Subject identifier.
    #[arg(short = 's', long = "subject")]
    pub subject: String,

    /// Where to move the finished subject tree.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub toolkit: ToolkitArgs,
}

/// Arguments for `multiscale-atlas batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Headerless cohort CSV (`sub-ID,path`), as written by `resolve`.
    #[arg(long)]
    pub cohort: PathBuf,

    /// Directory receiving each finished subject tree as `<root>/<id>`.
    #[arg(long)]
    pub output_root: Option<PathBuf>,

    /// Maximum number of subjects processed at the same time.
    #[arg(short = 'j', long, env = "PIPELINE_MAX_CONCURRENT_SUBJECTS", default_value_t = DEFAULT_BATCH_JOBS)]
    pub jobs: usize,

    #[command(flatten)]
    pub toolkit: ToolkitArgs,
}

/// Where index rows come from.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct IndexSource {
    /// BIDS dataset root to walk.
    #[arg(long)]
    pub bids: Option<PathBuf>,

    /// Index table exported as CSV.
    #[arg(long)]
    pub index: Option<PathBuf>,
}

/// Arguments for `multiscale-atlas resolve`.
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub source: IndexSource,

    /// Output CSV. Written to stdout when omitted.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Image suffix to resolve.
    #[arg(long, default_value = "T1w")]
    pub suffix: String,

    /// Allowed sessions, highest priority first (repeatable).
    #[arg(long = "session")]
    pub sessions: Vec<String>,
}

/// Arguments for `multiscale-atlas resolve-multimodal`.
#[derive(Parser, Debug)]
pub struct MultimodalArgs {
    #[command(flatten)]
    pub source: IndexSource,

    /// Modality to resolve (dwi or fmap).
    #[arg(long)]
    pub modality: Modality,
}

/// Parse CLI arguments without running any command.
///
/// Useful when you need to access CLI options (like log_level) before running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_subject_command(args).await,
        Commands::Batch(args) => run_batch_command(args).await,
        Commands::Resolve(args) => run_resolve_command(args),
        Commands::ResolveMultimodal(args) => run_multimodal_command(args),
    }
}

// ============================================================================
// Pipeline commands
// ============================================================================

/// Loads the toolkit environment, falling back to the default file in the
/// working directory.
fn load_environment(args: &ToolkitArgs) -> anyhow::Result<ToolkitEnvironment> {
    let default_file = Path::new(DEFAULT_ENV_FILE);
    let env_file = match &args.env_file {
        Some(path) => Some(path.as_path()),
        None if default_file.is_file() => Some(default_file),
        None => None,
    };

    ToolkitEnvironment::load(env_file).context("Failed to load toolkit environment")
}

fn build_config(args: &ToolkitArgs, workers: usize) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?.with_max_concurrent_subjects(workers);
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }
    if let Some(source) = &args.source_subject {
        config = config.with_source_subject(source);
    }
    if let Some(atlas) = &args.atlas {
        config = config.with_atlas(atlas);
    }
    if args.dry_run {
        config = config.with_dry_run(true);
    }
    config.validate()?;
    Ok(config)
}

/// Invoker for the configured mode. The recording handle is returned for
/// dry runs so the plan can be printed afterwards.
fn build_invoker(
    config: &PipelineConfig,
    stream_output: bool,
) -> (Arc<dyn ToolInvoker>, Option<Arc<RecordingInvoker>>) {
    if config.dry_run {
        let recorder = Arc::new(RecordingInvoker::new());
        (recorder.clone(), Some(recorder))
    } else {
        let invoker = ProcessInvoker::new().with_streamed_output(stream_output);
        (Arc::new(invoker), None)
    }
}

/// Report of a cohort run plus, for dry runs, every command that would
/// have been executed.
struct CohortExecution {
    report: CohortReport,
    plan: Vec<ToolInvocation>,
}

impl CohortExecution {
    fn print_plan(&self) {
        for invocation in &self.plan {
            println!("{}", invocation.display_command());
        }
    }
}

/// Bootstraps the toolkit and runs `subjects`. Dry runs record the
/// commands and plan the output moves without touching any subject tree.
async fn execute_cohort(
    config: PipelineConfig,
    env: ToolkitEnvironment,
    subjects: Vec<Subject>,
    stream_output: bool,
) -> anyhow::Result<CohortExecution> {
    let (invoker, recorder) = build_invoker(&config, stream_output);
    let orchestrator = CohortOrchestrator::new(config, env, invoker)?;
    let report = orchestrator.run(subjects).await?;

    let plan = recorder.map(|r| r.calls()).unwrap_or_default();
    Ok(CohortExecution { report, plan })
}

async fn run_subject_command(args: RunArgs) -> anyhow::Result<()> {
    let env = load_environment(&args.toolkit)?;
    let config = build_config(&args.toolkit, 1)?;

    if !config.dry_run && !args.t1.is_file() {
        anyhow::bail!("Input image does not exist: {}", args.t1.display());
    }

    let mut subject = Subject::in_environment(&args.subject, &args.t1, &env)?;
    if let Some(output) = &args.output {
        subject = subject.with_destination(output);
    }

    let dry_run = config.dry_run;
    let execution = execute_cohort(config, env, vec![subject], true).await?;
    execution.print_plan();

    let Some(subject_report) = execution.report.reports.first() else {
        anyhow::bail!("No report produced for subject {}", args.subject);
    };

    match &subject_report.failure {
        None => {
            if dry_run {
                println!("✓ {} planned (dry run)", subject_report.subject_id);
            } else {
                println!("✓ {} completed", subject_report.subject_id);
            }
            if let Some(path) = &subject_report.final_path {
                println!("  Output dir: {}", path.display());
            }
            println!("  Invocations: {}", subject_report.invocations);
            println!("  Duration: {:.1}s", subject_report.duration.as_secs_f64());
            Ok(())
        }
        Some(failure) => anyhow::bail!("{}", failure.message),
    }
}

#[derive(Debug, Serialize)]
struct BatchOutput<'a> {
    status: &'static str,
    cohort: String,
    #[serde(flatten)]
    report: &'a CohortReport,
}

async fn run_batch_command(args: BatchArgs) -> anyhow::Result<()> {
    let env = load_environment(&args.toolkit)?;
    let config = build_config(&args.toolkit, args.jobs)?;

    let file = fs::File::open(&args.cohort)
        .with_context(|| format!("Failed to open cohort file {}", args.cohort.display()))?;
    let subjects = read_cohort_csv(file, env.subjects_dir(), args.output_root.as_deref())
        .with_context(|| format!("Failed to read cohort file {}", args.cohort.display()))?;

    if let Some(root) = args.output_root.as_ref().filter(|_| !config.dry_run) {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create output root {}", root.display()))?;
    }

    info!(
        "Running {} subjects from {} with {} workers",
        subjects.len(),
        args.cohort.display(),
        config.max_concurrent_subjects
    );

    let execution = execute_cohort(config, env, subjects, false).await?;
    execution.print_plan();
    let report = execution.report;

    let output = BatchOutput {
        status: if report.has_failures() {
            "failed"
        } else {
            "success"
        },
        cohort: args.cohort.display().to_string(),
        report: &report,
    };
    let json_output = serde_json::to_string_pretty(&output)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);

    if report.has_failures() {
        for failed in report.failures() {
            warn!(subject = %failed.subject_id, "Subject did not complete");
        }
        anyhow::bail!(
            "{} of {} subjects failed",
            report.stats.failed,
            report.stats.total_executed
        );
    }
    Ok(())
}

// ============================================================================
// Resolution commands
// ============================================================================

fn open_index(source: &IndexSource) -> anyhow::Result<Box<dyn DatasetIndex>> {
    match (&source.bids, &source.index) {
        (Some(root), _) => Ok(Box::new(BidsDirectoryIndex::new(root)?)),
        (None, Some(table)) => Ok(Box::new(InMemoryIndex::from_csv_path(table).with_context(
            || format!("Failed to load index table {}", table.display()),
        )?)),
        (None, None) => anyhow::bail!("Either --bids or --index is required"),
    }
}

fn run_resolve_command(args: ResolveArgs) -> anyhow::Result<()> {
    let index = open_index(&args.source)?;

    let mut query = AnatomicalQuery::new().with_suffix(&args.suffix);
    if !args.sessions.is_empty() {
        query = query.with_session_priority(args.sessions.iter().cloned());
    }

    let cohort = resolve_anatomical(index.as_ref(), &query)?;
    if cohort.is_empty() {
        warn!("No subjects matched suffix {}", args.suffix);
    }

    match &args.out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_reconall_csv(&cohort.records, file)?;
            info!("Wrote {} subjects to {}", cohort.len(), path.display());
        }
        None => write_reconall_csv(&cohort.records, std::io::stdout().lock())?,
    }
    Ok(())
}

fn run_multimodal_command(args: MultimodalArgs) -> anyhow::Result<()> {
    let index = open_index(&args.source)?;
    let files = resolve_multimodal(index.as_ref(), args.modality)?;

    let json_output = serde_json::to_string_pretty(&files)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}
