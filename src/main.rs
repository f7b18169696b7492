use anyhow::Context;
use clap::{Parser, Subcommand};
use gcs_ingest::{
    cleanup, load_config, plan_task, resume, ConfigDiff, DefaultClassifier, FileInputProcessor,
    GcsClient, InputConfig, ObjectStore, ParallelControl, RetryClassifier, SinkTarget,
    TaskDescriptor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gcs-ingest")]
#[command(about = "Discover, partition and stream Google Cloud Storage objects", long_about = None)]
#[command(version)]
struct Args {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List and partition files without reading them
    Plan {
        /// TOML config file (GCS_INGEST_* variables override it)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Checkpoint file from a previous run
        #[arg(long)]
        state: Option<PathBuf>,

        /// Write the task descriptor here
        #[arg(long)]
        dump_task: Option<PathBuf>,
    },

    /// Discover files, stream every task and save the checkpoint
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory that mirrors the object keys; bytes are discarded if unset
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        state: Option<PathBuf>,

        #[arg(long)]
        dump_task: Option<PathBuf>,

        /// Record failed tasks in the report instead of aborting
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Run the tasks of a dumped descriptor without listing again
    Resume {
        /// Task descriptor written by `plan --dump-task` or `run --dump-task`
        #[arg(short, long)]
        task: PathBuf,

        /// Number of tasks to run; defaults to all of them
        #[arg(long)]
        task_count: Option<usize>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        state: Option<PathBuf>,

        #[arg(long)]
        continue_on_error: bool,
    },

    /// Remove a dumped task descriptor
    Cleanup {
        #[arg(short, long)]
        task: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("gcs_ingest={}", log_level))
        .init();

    let started = Instant::now();
    match args.command {
        Command::Plan {
            config,
            state,
            dump_task,
        } => {
            let config = prepare_config(config.as_deref(), state.as_deref())?;
            let (store, classifier) = connect(&config)?;
            let descriptor = plan_task(config, store.as_ref(), classifier.as_ref()).await?;
            if let Some(path) = dump_task {
                descriptor.dump(&path)?;
            }
            for (index, paths) in (0..descriptor.task_count())
                .map(|i| descriptor.files.task_paths(i).map(|p| (i, p)))
                .collect::<Result<Vec<_>, _>>()?
            {
                println!("task {index}: {}", paths.join(", "));
            }
        }

        Command::Run {
            config,
            output,
            state,
            dump_task,
            continue_on_error,
        } => {
            let config = prepare_config(config.as_deref(), state.as_deref())?;
            let (store, classifier) = connect(&config)?;
            let descriptor = plan_task(config, store.as_ref(), classifier.as_ref()).await?;
            if let Some(path) = dump_task {
                descriptor.dump(&path)?;
            }
            let task_count = descriptor.task_count();
            let diff = dispatch(
                &descriptor,
                task_count,
                store,
                classifier,
                output,
                continue_on_error,
            )
            .await?;
            finish(&diff, state.as_deref())?;
        }

        Command::Resume {
            task,
            task_count,
            output,
            state,
            continue_on_error,
        } => {
            let mut descriptor = TaskDescriptor::load(&task)
                .with_context(|| format!("failed to load task descriptor {}", task.display()))?;
            descriptor.config.restore_access_token();
            let (store, classifier) = connect(&descriptor.config)?;
            let task_count = task_count.unwrap_or_else(|| descriptor.task_count());
            let diff = dispatch(
                &descriptor,
                task_count,
                store,
                classifier,
                output,
                continue_on_error,
            )
            .await?;
            finish(&diff, state.as_deref())?;
        }

        Command::Cleanup { task } => {
            let descriptor = TaskDescriptor::load(&task)
                .with_context(|| format!("failed to load task descriptor {}", task.display()))?;
            cleanup(&descriptor, descriptor.task_count(), &[]);
            std::fs::remove_file(&task)
                .with_context(|| format!("failed to remove {}", task.display()))?;
        }
    }

    info!(
        "✅ Done in {}",
        humantime::format_duration(std::time::Duration::from_secs(started.elapsed().as_secs()))
    );
    Ok(())
}

/// Loads the config and applies the checkpoint saved by the previous run.
fn prepare_config(path: Option<&Path>, state: Option<&Path>) -> anyhow::Result<InputConfig> {
    let mut config = load_config(path).context("failed to load configuration")?;

    if let Some(state) = state.filter(|s| s.exists()) {
        let diff = ConfigDiff::load(state)
            .with_context(|| format!("failed to read checkpoint {}", state.display()))?;
        match diff.last_path {
            Some(last_path) if config.incremental => {
                info!(last_path = %last_path, "Resuming after checkpoint");
                config.last_path = Some(last_path);
            }
            Some(_) => warn!("Ignoring checkpoint because incremental is disabled"),
            None => {}
        }
    }

    config.validate()?;
    Ok(config)
}

fn connect(
    config: &InputConfig,
) -> anyhow::Result<(Arc<dyn ObjectStore>, Arc<dyn RetryClassifier>)> {
    let store: Arc<dyn ObjectStore> = Arc::new(GcsClient::from_config(config)?);
    let classifier: Arc<dyn RetryClassifier> = Arc::new(DefaultClassifier::new());
    Ok((store, classifier))
}

async fn dispatch(
    descriptor: &TaskDescriptor,
    task_count: usize,
    store: Arc<dyn ObjectStore>,
    classifier: Arc<dyn RetryClassifier>,
    output: Option<PathBuf>,
    continue_on_error: bool,
) -> anyhow::Result<ConfigDiff> {
    let target = match output {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            SinkTarget::Directory(dir)
        }
        None => SinkTarget::Discard,
    };

    info!(
        "🚀 Ingesting {} task(s) from gs://{}",
        task_count, descriptor.config.bucket
    );
    let processor = FileInputProcessor::new(store, target, classifier);
    let control = ParallelControl::new(processor, descriptor.config.max_concurrent_tasks)
        .continue_on_error(continue_on_error)
        .show_progress(true);

    Ok(resume(descriptor, task_count, &control).await?)
}

fn finish(diff: &ConfigDiff, state: Option<&Path>) -> anyhow::Result<()> {
    if let Some(state) = state {
        diff.save(state)
            .with_context(|| format!("failed to write checkpoint {}", state.display()))?;
    }
    println!("{diff}");
    Ok(())
}
