//! The `glimpse describe` command: discover images, run one batch, stream results.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, ValueEnum};
use glimpse_core::output::{described_images, terminate_last_line};
use glimpse_core::{
    BatchEvent, BatchSummary, Config, FileDiscovery, Glimpse, Job, OutputFormat as CoreFormat,
    PathSetIndex, ProgressUpdate, Prompt, PromptLibrary, ProviderKind, ResultWriter,
};
use indicatif::{ProgressBar, ProgressStyle};

/// Arguments for the `describe` command.
#[derive(Args, Debug)]
pub struct DescribeArgs {
    /// Image file or directory to describe
    #[arg(required = true)]
    pub input: PathBuf,

    /// Vision provider: ollama, anthropic, openai, on_device
    #[arg(short, long, default_value = "ollama")]
    pub provider: ProviderKind,

    /// Model name (defaults to the provider's configured model)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Prompt style from the prompt library
    #[arg(short, long, conflicts_with = "prompt")]
    pub style: Option<String>,

    /// Literal prompt text (ignored by providers without custom prompt support)
    #[arg(long)]
    pub prompt: Option<String>,

    /// Text prepended to every description
    #[arg(long)]
    pub prefix: Option<String>,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "jsonl")]
    pub format: OutputFormat,

    /// Skip images already described in the output file
    #[arg(long, requires = "output")]
    pub skip_existing: bool,
}

/// Supported output formats.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    /// Single JSON array, written when the batch ends
    Json,
    /// One JSON object per line, written as each image finishes
    Jsonl,
}

impl From<OutputFormat> for CoreFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => CoreFormat::Json,
            OutputFormat::Jsonl => CoreFormat::JsonLines,
        }
    }
}

/// Execute the describe command.
pub async fn execute(args: DescribeArgs, config: Config) -> anyhow::Result<()> {
    if args.skip_existing && matches!(args.format, OutputFormat::Json) {
        anyhow::bail!("--skip-existing needs --format jsonl (a JSON array can't be appended to)");
    }

    let input = expand(&args.input);
    if !input.exists() {
        anyhow::bail!("Path does not exist: {}", input.display());
    }

    let discovery = FileDiscovery::new(&config.batch.supported_formats);
    let files = discovery.discover(&input);
    if files.is_empty() {
        anyhow::bail!("No supported images found at {}", input.display());
    }
    tracing::info!(
        "Found {} images ({:.1} MB)",
        files.len(),
        FileDiscovery::total_size(&files) as f64 / 1_000_000.0
    );

    let prompt = select_prompt(&args, &config);
    let model = args
        .model
        .clone()
        .unwrap_or_else(|| config.default_model(args.provider).to_string());
    let jobs = build_jobs(
        files.into_iter().map(|f| f.path),
        args.provider,
        &model,
        &prompt,
        args.prefix.as_deref(),
        args.skip_existing,
    );

    let index = match &args.output {
        Some(path) if args.skip_existing => load_index(path)?,
        _ => PathSetIndex::default(),
    };
    if !index.is_empty() {
        tracing::info!("Loaded {} described images from output file", index.len());
    }

    let mut writer = ResultWriter::new(
        open_output(args.output.as_deref(), args.skip_existing)?,
        args.format.into(),
        true,
    );

    let glimpse = Glimpse::new(config).configure(|o| o.with_index(Arc::new(index)));
    tracing::info!("Describing with {} ({})", args.provider, model);
    let handle = glimpse.submit_batch(jobs);
    let mut events = handle.events()?;
    let progress = create_progress_bar(handle.total() as u64);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;
    let mut loop_error = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    BatchEvent::Started { .. } => {}
                    BatchEvent::JobFinished(result) => {
                        if !matches!(result.outcome, glimpse_core::JobOutcome::Skipped) {
                            writer.push(&result)?;
                        }
                    }
                    BatchEvent::Progress(update) => {
                        progress.set_position(update.finished as u64);
                        progress.set_message(progress_message(&update));
                    }
                    BatchEvent::Completed(_) => break,
                    BatchEvent::Failed { error, .. } => {
                        loop_error = Some(error);
                        break;
                    }
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                progress.set_message("stopping after current image...");
                tracing::warn!("Interrupted, stopping after the current image");
                handle.stop();
            }
        }
    }

    progress.finish_and_clear();
    writer.finish()?;
    if let Some(path) = &args.output {
        tracing::info!("Output written to {:?}", path);
    }

    let summary = handle.wait().await?;
    print_summary(&summary);

    if let Some(error) = loop_error {
        anyhow::bail!("Batch aborted: {error}");
    }
    Ok(())
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// Literal text wins over a style; no flag means the configured default style.
fn select_prompt(args: &DescribeArgs, config: &Config) -> Prompt {
    if let Some(text) = &args.prompt {
        return Prompt::Text(text.clone());
    }
    match &args.style {
        Some(style) => {
            let library = PromptLibrary::from_config(&config.prompts);
            if !library.contains(style) {
                let known: Vec<&str> = library.style_names().collect();
                tracing::warn!(
                    "Unknown prompt style '{style}', using the default (known: {})",
                    known.join(", ")
                );
            }
            Prompt::Style(style.clone())
        }
        None => Prompt::Style(config.prompts.default_style.clone()),
    }
}

fn build_jobs(
    paths: impl IntoIterator<Item = PathBuf>,
    provider: ProviderKind,
    model: &str,
    prompt: &Prompt,
    prefix: Option<&str>,
    skip_existing: bool,
) -> Vec<Job> {
    paths
        .into_iter()
        .map(|path| {
            let job = Job::new(path, provider, model)
                .with_prompt(prompt.clone())
                .skip_if_described(skip_existing);
            match prefix {
                Some(prefix) => job.with_prefix(prefix),
                None => job,
            }
        })
        .collect()
}

/// Read already-described images from an existing JSONL output file.
fn load_index(path: &Path) -> anyhow::Result<PathSetIndex> {
    if !path.exists() {
        return Ok(PathSetIndex::default());
    }
    let file = File::open(path)?;
    Ok(described_images(BufReader::new(file))?)
}

/// Append when resuming, otherwise truncate. No path means stdout.
fn open_output(path: Option<&Path>, append: bool) -> io::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = if append {
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(path)?;
                terminate_last_line(&mut file)?;
                file
            } else {
                File::create(path)?
            };
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}

fn progress_message(update: &ProgressUpdate) -> String {
    format!(
        "{:.1}s/img, eta {}",
        update.average.as_secs_f64(),
        indicatif::HumanDuration(update.eta)
    )
}

/// Create a progress bar for batch processing.
fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
    ) {
        pb.set_style(style.progress_chars("##-"));
    }
    pb.set_message("starting...");
    pb
}

/// Print a formatted summary table after the batch ends.
fn print_summary(summary: &BatchSummary) {
    eprintln!();
    eprintln!("  ====================================");
    eprintln!("               Summary");
    eprintln!("  ====================================");
    eprintln!("    Described:    {:>8}", summary.completed);
    if summary.failed > 0 {
        eprintln!("    Failed:       {:>8}", summary.failed);
    }
    if summary.skipped > 0 {
        eprintln!("    Skipped:      {:>8}", summary.skipped);
    }
    if summary.processed < summary.total {
        eprintln!("    Not started:  {:>8}", summary.total - summary.processed);
    }
    eprintln!("  ------------------------------------");
    eprintln!("    Total:        {:>8}", summary.total);
    eprintln!("    Status:       {:>8?}", summary.status);
    eprintln!("    Duration:     {:>7.1}s", summary.elapsed.as_secs_f64());
    if summary.usage.count > 0 {
        eprintln!("    Tokens:       {:>8}", summary.usage.total);
        eprintln!("    Avg tokens:   {:>8.0}", summary.usage.avg_total);
        if let Some(peak) = &summary.usage.peak {
            eprintln!("    Peak:         {} ({} tokens)", peak.label, peak.total_tokens);
        }
    }
    eprintln!("  ====================================");

    let recoverable = summary.recoverable_failures().count();
    if recoverable > 0 {
        eprintln!("  {recoverable} failures may succeed on a rerun with --skip-existing");
    }
    for failure in summary.configuration_failures().take(3) {
        eprintln!(
            "  Setup problem ({:?}): {} - {}",
            failure.kind,
            failure.image.display(),
            failure.message
        );
    }
}
