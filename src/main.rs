use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use nimbus_agent::agent::{running_agent_pid, AgentCore};
use nimbus_agent::config::{AgentConfig, KernelConfig};
use nimbus_agent::events::{AgentEvent, EventBus, JobEvent};
use nimbus_agent::executor::{JobSpec, JobStatus};
use nimbus_agent::kernel::{ExecuteRequest, ExecuteStatus, KernelManager};
use nimbus_agent::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "nimbus-agent")]
#[command(version)]
#[command(about = "A local compute agent for shell jobs and Python kernels")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the agent and keep it running until signalled
    Start(StartArgs),

    /// Run a single job in a transient agent and wait for it
    Run(RunArgs),

    /// Execute Python code in a transient kernel
    Exec(ExecArgs),

    /// Show whether an agent is running on this host
    Status(StatusArgs),
}

// =============================================================================
// Start Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StartArgs {
    /// Agent name reported to the gateway
    #[arg(long, default_value = "nimbus-agent")]
    name: String,

    /// Gateway registration endpoint (omit to run standalone)
    /// Example: "http://127.0.0.1:7070/api/agents"
    #[arg(long)]
    gateway_url: Option<String>,

    /// Bearer token attached to gateway requests
    #[arg(long, env = "NIMBUS_AGENT_TOKEN")]
    auth_token: Option<String>,

    /// User identifier forwarded with gateway requests
    #[arg(long, env = "NIMBUS_AGENT_USER")]
    user_id: Option<String>,

    /// Stop the agent after this many idle minutes (0 disables)
    #[arg(long, default_value = "0")]
    idle_timeout_minutes: u64,

    /// PID file enforcing the single-instance lock
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Inline script, executed with sh -c
    #[arg(conflicts_with = "path")]
    script: Option<String>,

    /// Script file, interpreter chosen by extension
    #[arg(long, short = 'p')]
    path: Option<PathBuf>,

    /// Job name for listings and events
    #[arg(long, default_value = "cli-job")]
    name: String,

    /// Queue priority (higher runs first)
    #[arg(long, default_value = "0")]
    priority: i32,

    /// Environment overrides, KEY=VALUE (bare KEY unsets)
    #[arg(long, short = 'e')]
    env: Vec<String>,

    /// Working directory for the job
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Exec Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Python source to execute in a fresh kernel
    code: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Status Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StatusArgs {
    /// PID file to probe
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunOutput {
    job_id: String,
    name: String,
    status: String,
    exit_code: Option<i32>,
    duration_ms: Option<u64>,
    error: Option<String>,
    logs: Vec<String>,
}

#[derive(Serialize)]
struct StatusOutput {
    running: bool,
    pid: Option<u32>,
    pid_file: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env(entries: &[String]) -> HashMap<String, Option<String>> {
    let mut env = HashMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) => env.insert(key.to_string(), Some(value.to_string())),
            None => env.insert(entry.clone(), None),
        };
    }
    env
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Agent Implementation
// =============================================================================

async fn run_agent(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = AgentConfig::default()
        .with_name(&args.name)
        .with_idle_timeout_ms(args.idle_timeout_minutes * 60_000);
    if let Some(pid_file) = args.pid_file {
        config = config.with_pid_file(pid_file);
    }
    match args.gateway_url {
        Some(url) => {
            config = config.with_gateway_url(&url);
            config.gateway.auth_token = args.auth_token;
            config.gateway.user_id = args.user_id;
        }
        None => config.gateway.enabled = false,
    }

    let core = AgentCore::start(config).await?;
    let shutdown = install_shutdown_handler();
    let stopped = core.stopped();

    // The agent exits on a signal or when its own idle timer stops it.
    tokio::select! {
        _ = shutdown.cancelled() => {
            core.stop().await;
        }
        _ = stopped.cancelled() => {}
    }

    Ok(())
}

// =============================================================================
// One-Shot Command Handlers
// =============================================================================

async fn run_job(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // A transient agent with its own PID file, so a resident agent on
    // this host is left alone.
    let pid_file =
        std::env::temp_dir().join(format!("nimbus-agent-run-{}.pid", std::process::id()));
    let mut config = AgentConfig::default().with_pid_file(pid_file);
    config.gateway.enabled = false;

    let core = AgentCore::start(config).await?;
    let mut events = core.subscribe();

    let spec = JobSpec {
        name: args.name,
        script: args.script,
        script_path: args.path,
        env: parse_env(&args.env),
        cwd: args.cwd,
        priority: args.priority,
    };
    let submitted = match core.executor().submit(spec).await {
        Ok(job) => job,
        Err(err) => {
            core.stop().await;
            return Err(err.into());
        }
    };
    let job_id = submitted.id;
    let stream_lines = matches!(args.output, OutputFormat::Table);

    loop {
        match events.recv().await {
            Ok(AgentEvent::Job(event)) => match event {
                JobEvent::Log { job_id: id, line } if id == job_id => {
                    if stream_lines {
                        println!("{}", line);
                    }
                }
                JobEvent::Completed { job_id: id, .. }
                | JobEvent::Failed { job_id: id, .. }
                | JobEvent::Cancelled { job_id: id }
                    if id == job_id =>
                {
                    break;
                }
                _ => {}
            },
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                // The dropped events may include the terminal one.
                match core.executor().get_job(job_id).await {
                    Some(job) if job.status.is_terminal() => break,
                    Some(_) => {}
                    None => break,
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    let job = core
        .executor()
        .get_job(job_id)
        .await
        .ok_or("job record disappeared before it settled")?;
    let logs = core
        .executor()
        .get_job_logs(job_id, None)
        .await
        .unwrap_or_default();
    core.stop().await;

    match args.output {
        OutputFormat::Json => {
            let output = RunOutput {
                job_id: job.id.to_string(),
                name: job.name.clone(),
                status: job.status.to_string(),
                exit_code: job.exit_code,
                duration_ms: job.duration_ms,
                error: job.error.clone(),
                logs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if job.status != JobStatus::Completed {
                let reason = job.error.clone().unwrap_or_else(|| "unknown".to_string());
                eprintln!("Job {}: {}", job.status, reason);
            }
        }
    }

    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::Failed => std::process::exit(job.exit_code.unwrap_or(1)),
        _ => std::process::exit(1),
    }
}

async fn run_exec(args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let events = EventBus::new();
    let kernels = KernelManager::new(KernelConfig::default(), events);

    let request = ExecuteRequest {
        kernel_id: None,
        code: args.code,
    };
    let result = kernels.execute_code(request).await;
    kernels.shutdown_all().await;
    let result = result?;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Table => {
            for chunk in &result.outputs {
                println!("{}", chunk);
            }
            if let Some(error) = &result.error {
                eprintln!("{}: {}", error.name, error.message);
                if let Some(traceback) = &error.traceback {
                    eprint!("{}", traceback);
                }
            }
        }
    }

    if matches!(result.status, ExecuteStatus::Error) {
        std::process::exit(1);
    }
    Ok(())
}

fn show_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let pid_file = args
        .pid_file
        .unwrap_or_else(|| AgentConfig::default().pid_file);
    let pid = running_agent_pid(&pid_file);

    match args.output {
        OutputFormat::Json => {
            let output = StatusOutput {
                running: pid.is_some(),
                pid,
                pid_file: pid_file.display().to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => match pid {
            Some(pid) => {
                println!("Agent:    running");
                println!("PID:      {}", pid);
                println!("PID file: {}", pid_file.display());
            }
            None => {
                println!("No agent is running ({})", pid_file.display());
            }
        },
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Start(start_args) => run_agent(start_args).await?,
        Commands::Run(run_args) => run_job(run_args).await?,
        Commands::Exec(exec_args) => run_exec(exec_args).await?,
        Commands::Status(status_args) => show_status(status_args)?,
    }

    Ok(())
}
