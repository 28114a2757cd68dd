use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use script_agent::agent::{AgentClient, AgentServer};
use script_agent::config::{AgentConfig, ClientConfig, HostConfig};
use script_agent::job::{JobOutcome, LogMessage, MessageLevel};
use script_agent::script::{extract_variables, ExecuteScriptJob, ScriptResult};
use script_agent::service::ControlServiceJob;
use script_agent::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "script-agent")]
#[command(version)]
#[command(about = "Run PowerShell scripts and service operations on a remote agent")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start an agent that executes dispatched jobs
    Agent(AgentArgs),

    /// Execute a script on an agent
    Exec {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Start or stop a service on an agent
    Service {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ServiceCommands,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, default_value = "47100")]
    port: u16,

    /// PowerShell executable used to run scripts
    #[arg(long, default_value = "pwsh")]
    pwsh: PathBuf,

    /// Maximum number of jobs executing at once
    #[arg(long, default_value = "8")]
    max_jobs: usize,
}

// =============================================================================
// Client Arguments (shared by exec and service commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Agent address
    #[arg(long, short = 'a', default_value = "127.0.0.1:47100")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Script text to execute
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    script: Option<String>,

    /// Read the script from a file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Show the script's debug stream
    #[arg(long)]
    debug: bool,

    /// Show the script's verbose stream
    #[arg(long)]
    verbose: bool,

    /// Return the script's output lines in the result
    #[arg(long)]
    collect_output: bool,

    /// Do not log each output object as it is produced
    #[arg(long)]
    no_log_output: bool,

    /// Context variable (NAME=VALUE); only variables the script references are sent
    #[arg(long = "var", value_parser = parse_key_value)]
    variables: Vec<(String, String)>,

    /// Script parameter (NAME=VALUE)
    #[arg(long = "param", value_parser = parse_key_value)]
    parameters: Vec<(String, String)>,

    /// Variable to read back after the script finishes
    #[arg(long = "out-var")]
    output_variables: Vec<String>,

    /// Log what would run without dispatching anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ServiceCommands {
    /// Start a service
    Start {
        name: String,

        /// Return once the start request is accepted
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop a service
    Stop {
        name: String,

        /// Return once the stop request is accepted
        #[arg(long)]
        no_wait: bool,
    },
}

// =============================================================================
// JSON Output Structs
// =============================================================================

#[derive(Serialize)]
struct ScriptOutput {
    exit_code: Option<i32>,
    output: Vec<String>,
    output_variables: BTreeMap<String, Option<String>>,
}

impl From<ScriptResult> for ScriptOutput {
    fn from(result: ScriptResult) -> Self {
        Self {
            exit_code: result.exit_code,
            output_variables: result
                .output_variables
                .iter()
                .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
                .collect(),
            output: result.output,
        }
    }
}

#[derive(Serialize)]
struct ServiceOutput {
    service: String,
    action: &'static str,
    cancelled: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Re-emit a message logged by a job on the agent.
fn forward_log(message: LogMessage) {
    match message.level {
        MessageLevel::Debug => tracing::debug!(target: "agent", "{}", message.message),
        MessageLevel::Information => tracing::info!(target: "agent", "{}", message.message),
        MessageLevel::Warning => tracing::warn!(target: "agent", "{}", message.message),
        MessageLevel::Error => tracing::error!(target: "agent", "{}", message.message),
    }
}

// =============================================================================
// Agent Implementation
// =============================================================================

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::new(SocketAddr::new(args.bind, args.port))
        .with_max_concurrent_jobs(args.max_jobs)
        .with_host(HostConfig::default().with_program(args.pwsh));

    tracing::info!(
        listen_addr = %config.listen_addr,
        pwsh = %config.host.program.display(),
        "Starting script agent"
    );

    let shutdown = install_shutdown_handler();
    AgentServer::with_system_backends(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_exec(
    client_args: ClientArgs,
    args: ExecArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let script_text = match (args.script, args.file) {
        (Some(script), _) => script,
        (None, Some(path)) => tokio::fs::read_to_string(&path).await?,
        (None, None) => return Err("either --script or --file is required".into()),
    };

    let context: HashMap<String, String> = args.variables.into_iter().collect();
    let job = ExecuteScriptJob {
        variables: extract_variables(&script_text, &context),
        script_text,
        debug_logging: args.debug,
        verbose_logging: args.verbose,
        collect_output: args.collect_output,
        log_output: !args.no_log_output,
        parameters: args.parameters.into_iter().collect(),
        output_variables: args.output_variables,
    };

    if args.dry_run {
        tracing::info!(
            addr = %client_args.addr,
            variables = ?job.variables.keys().collect::<Vec<_>>(),
            parameters = ?job.parameters.keys().collect::<Vec<_>>(),
            "Simulation mode: script would be executed"
        );
        return Ok(());
    }

    let client = AgentClient::new(ClientConfig::new(client_args.addr));
    let cancel = install_shutdown_handler();
    let outcome = client.execute(&job, &cancel, forward_log).await?;

    let JobOutcome::Completed(result) = outcome else {
        eprintln!("Job cancelled");
        std::process::exit(1);
    };
    if let Some(exit_code) = result.exit_code {
        tracing::info!("Script exit code: {}", exit_code);
    }

    match client_args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ScriptOutput::from(result))?);
        }
        OutputFormat::Table => {
            if let Some(exit_code) = result.exit_code {
                println!("Exit Code: {}", exit_code);
            }
            if !result.output.is_empty() {
                println!("Output:");
                for line in &result.output {
                    println!("  {}", line);
                }
            }
            if !result.output_variables.is_empty() {
                println!("Variables:");
                for (name, value) in result.output_variables.iter() {
                    match value {
                        Some(value) => println!("  {:<20} {}", name, value),
                        None => println!("  {:<20} (unset)", name),
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_service(
    client_args: ClientArgs,
    command: ServiceCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let (job, action) = match command {
        ServiceCommands::Start { name, no_wait } => {
            tracing::info!("Starting service {}...", name);
            (ControlServiceJob::start(name, !no_wait), "start")
        }
        ServiceCommands::Stop { name, no_wait } => {
            tracing::info!("Stopping service {}...", name);
            (ControlServiceJob::stop(name, !no_wait), "stop")
        }
    };

    let client = AgentClient::new(ClientConfig::new(client_args.addr));
    let cancel = install_shutdown_handler();
    let outcome = client.execute(&job, &cancel, forward_log).await?;

    match client_args.output {
        OutputFormat::Json => {
            let output = ServiceOutput {
                service: job.service_name,
                action,
                cancelled: outcome.is_cancelled(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if outcome.is_cancelled() {
                println!("Service {} {}: cancelled", job.service_name, action);
            } else {
                println!("Service {} {}: done", job.service_name, action);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Agent(agent_args) => {
            run_agent(agent_args).await?;
        }
        Commands::Exec { client, exec } => {
            handle_exec(client, exec).await?;
        }
        Commands::Service { client, command } => {
            handle_service(client, command).await?;
        }
    }

    Ok(())
}
