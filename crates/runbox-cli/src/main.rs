//! runbox CLI
//!
//! Runs source files through the runbox orchestrator from the command line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use runbox::{
    BackendKind, Config, EXAMPLE_CONFIG, ExecutionRequest, ExecutionResult, Orchestrator,
    ResourceLimits,
};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runbox")]
#[command(about = "Run untrusted code in sandboxes")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sandbox backend, overriding the configuration
    #[arg(short, long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Local,
    Isolate,
    Docker,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Local => BackendKind::Local,
            BackendArg::Isolate => BackendKind::Isolate,
            BackendArg::Docker => BackendKind::Docker,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: runbox.toml)
        #[arg(short, long, default_value = "runbox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a source file and print its output
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID or alias (e.g., go, python, cpp)
        #[arg(short, long)]
        language: String,

        /// File fed to the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Wall time limit in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Memory limit in KB
        #[arg(short, long)]
        memory_limit: Option<u64>,

        /// Print the full result as JSON instead of the program's output
        #[arg(long)]
        json: bool,
    },

    /// List available languages
    Languages,

    /// Show the effective configuration
    ShowConfig,

    /// Remove sandboxes left behind by earlier runs
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };
    if let Some(backend) = cli.backend {
        config.backend.kind = backend.into();
    }

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            source,
            language,
            input,
            timeout,
            memory_limit,
            json,
        } => {
            let code = run(
                config,
                &source,
                &language,
                input.as_deref(),
                timeout,
                memory_limit,
                json,
            )
            .await?;
            std::process::exit(code);
        }
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
        Commands::Reap => reap(config).await,
    }
}

/// Run one file and return the exit code the CLI should exit with
async fn run(
    config: Config,
    source: &Path,
    language: &str,
    input: Option<&Path>,
    timeout: Option<f64>,
    memory_limit: Option<u64>,
    json: bool,
) -> Result<i32> {
    let source_content = tokio::fs::read(source)
        .await
        .context("failed to read source file")?;

    let mut request = ExecutionRequest::new(language, source_content);
    if let Some(input_path) = input {
        let data = tokio::fs::read(input_path)
            .await
            .context("failed to read input file")?;
        request = request.with_stdin(data);
    }
    if let Some(secs) = timeout {
        let timeout = Duration::try_from_secs_f64(secs).context("invalid timeout")?;
        request = request.with_timeout(timeout);
    }
    if let Some(memory) = memory_limit {
        request = request.with_limits(ResourceLimits::unset().with_memory(memory));
    }

    // Nothing to sweep concurrently for a one-shot run
    let mut config = config;
    config.reaper.enabled = false;
    let orchestrator = Orchestrator::start(config);

    info!(%language, "running program");
    let outcome = orchestrator.execute(request).await;
    orchestrator.shutdown().await;
    let result = outcome.context("job was not executed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("failed to serialize result")?
        );
    } else {
        std::io::stdout()
            .write_all(&result.stdout)
            .context("failed to write stdout")?;
        std::io::stderr()
            .write_all(&result.stderr)
            .context("failed to write stderr")?;
    }

    // Log execution info via tracing (stderr), keeping stdout clean for piping
    info!(
        reason = ?result.reason,
        wall_time = format_args!("{:.3}s", result.wall_time),
        cpu_time = ?result.cpu_time,
        memory = ?result.peak_memory,
        exit_code = ?result.exit_code,
        signal = ?result.signal,
        limit = ?result.limit_exceeded,
        truncated = result.output_truncated(),
        "execution result"
    );
    if let Some(message) = &result.message {
        info!(%message, "sandbox message");
    }

    Ok(exit_code(&result))
}

/// Mirror the program's exit status, shell style for signals
fn exit_code(result: &ExecutionResult) -> i32 {
    match (result.exit_code, result.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, lang) in languages {
        let aliases = if lang.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", lang.aliases.join(", "))
        };
        println!("  {:<15} {}{}", id, lang.name, aliases);
    }
}

fn show_config(config: &Config) {
    println!("Backend: {}", config.backend.kind);
    println!("Queue capacity: {}", config.queue_capacity);
    println!("Max concurrent jobs: {}", config.max_concurrent);
    println!("Sandbox name prefix: {}", config.name_prefix);
    println!(
        "Reaper: {}",
        if config.reaper.enabled {
            format!("every {}s", config.reaper.interval)
        } else {
            "disabled".to_owned()
        }
    );
    println!();
    print_limits("Default resource limits", &config.default_limits);
    println!();
    print_limits("Maximum resource limits", &config.max_limits);
    println!();
    match config.backend.kind {
        BackendKind::Isolate => {
            println!("Isolate binary: {}", config.backend.isolate.isolate_binary().display())
        }
        BackendKind::Docker => {
            println!("Docker binary: {}", config.backend.docker.docker_binary().display())
        }
        BackendKind::Local => println!(
            "Scratch root: {}",
            config.backend.local.scratch_root.display()
        ),
    }
    println!("Languages configured: {}", config.languages.len());
}

fn print_limits(title: &str, limits: &ResourceLimits) {
    println!("{title}:");
    println!("  CPU time: {:?} s", limits.cpu_time);
    println!("  Wall time: {:?} s", limits.wall_time);
    println!("  Memory: {:?} KB", limits.memory);
    println!("  Max processes: {:?}", limits.max_processes);
    println!("  Output: {:?} bytes", limits.output_limit);
    println!("  Network: {}", limits.network_allowed());
}

async fn reap(mut config: Config) -> Result<()> {
    config.reaper.enabled = false;
    let orchestrator = Orchestrator::start(config);
    let outcome = orchestrator.reap().await;
    orchestrator.shutdown().await;
    let summary = outcome.context("reaper pass failed")?;

    println!("Removed {} leftover sandboxes", summary.swept);
    Ok(())
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
