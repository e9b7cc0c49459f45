//! remote-deployer command line
//!
//! Usage:
//!   remote-deployer servers list
//!   remote-deployer deploy --package app.zip --server web-1 --file app.jar
//!   remote-deployer history --limit 20

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use remote_deployer::logging::{init_logging, LogOptions};
use remote_deployer::models::DEFAULT_SSH_PORT;
use remote_deployer::{
    DeployerConfig, DeploymentResult, DeploymentService, DeploymentTask, ProgressEvent,
    ServerTarget, SshTransport,
};

#[derive(Parser)]
#[command(name = "remote-deployer")]
#[command(about = "Deploy build artifacts to remote hosts over SSH", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage server targets
    Servers(ServersArgs),

    /// Check that a saved server accepts a connection
    Test {
        /// Server target name
        name: String,
    },

    /// Deploy a package to one or more servers
    Deploy(DeployArgs),

    /// Show recent deployment history
    History {
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Delete history records older than the given number of days
    CleanupHistory {
        #[arg(long)]
        days: u32,
    },

    /// Print today's audit log for a task
    Logs {
        task_id: String,
    },
}

#[derive(Args)]
struct ServersArgs {
    #[command(subcommand)]
    command: ServersSubcommand,
}

#[derive(Subcommand)]
enum ServersSubcommand {
    /// List saved server targets
    List,

    /// Add or update a server target
    Add(Box<ServerTargetArgs>),

    /// Remove a server target
    #[command(alias = "rm")]
    Remove { name: String },
}

#[derive(Args)]
struct ServerTargetArgs {
    /// Unique target name
    name: String,

    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
    port: u16,

    #[arg(long, short)]
    user: String,

    #[arg(long)]
    password: Option<String>,

    /// Private key file; takes precedence over --password
    #[arg(long)]
    key: Option<String>,

    #[arg(long)]
    passphrase: Option<String>,

    #[arg(long)]
    upload_dir: String,

    #[arg(long)]
    install_dir: String,

    #[arg(long)]
    backup_dir: String,

    /// Save the target as disabled
    #[arg(long)]
    disabled: bool,

    #[arg(long)]
    description: Option<String>,
}

#[derive(Args)]
struct DeployArgs {
    /// Local archive (.zip, .tar.gz, .tgz or .tar)
    #[arg(long, short)]
    package: PathBuf,

    /// Target server names, processed in the given order
    #[arg(long = "server", short, required = true)]
    servers: Vec<String>,

    /// Paths inside the archive to copy into the install directory
    #[arg(long = "file", short)]
    files: Vec<String>,

    /// Skip the pre-deployment backup
    #[arg(long)]
    no_backup: bool,

    /// Keep the uploaded archive and extraction directory
    #[arg(long)]
    keep_temp: bool,

    #[arg(long, short, default_value = "")]
    description: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(DeployerConfig::default_config_path);
    let config = DeployerConfig::load(&config_path)?;

    let _log_guard = init_logging(LogOptions {
        log_level: config.log_level.clone(),
        stdout: true,
        log_dir: config.app_log_dir.clone(),
    })?;

    let service = DeploymentService::open(config, Arc::new(SshTransport))
        .context("Failed to open deployment service")?;
    let outcome = run(&service, cli.command).await;
    service.close();
    outcome
}

async fn run(service: &DeploymentService, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Servers(args) => match args.command {
            ServersSubcommand::List => {
                let targets = service.list_server_targets()?;
                if targets.is_empty() {
                    println!("No server targets saved.");
                }
                for target in targets {
                    let state = if target.enabled { "enabled" } else { "disabled" };
                    println!(
                        "{:<20} {}@{}:{:<6} {:<9} {}",
                        target.name,
                        target.username,
                        target.host,
                        target.port,
                        state,
                        target.install_directory
                    );
                }
            }
            ServersSubcommand::Add(args) => {
                let target = args.into_target();
                service.save_server_target(&target)?;
                println!("Saved server target `{}`.", target.name);
            }
            ServersSubcommand::Remove { name } => {
                if !service.delete_server_target(&name)? {
                    bail!("Server target `{name}` not found");
                }
                println!("Removed server target `{name}`.");
            }
        },
        Commands::Test { name } => {
            let target = service
                .get_server_target(&name)?
                .with_context(|| format!("Server target `{name}` not found"))?;
            let printer = |event: ProgressEvent| println!("{event}");
            if !service.test_connection(target, Arc::new(printer)).await {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Deploy(args) => return deploy(service, args).await,
        Commands::History { limit } => {
            for record in service.list_deployment_history(limit)? {
                let outcome = if record.success { "OK" } else { "FAILED" };
                println!(
                    "{} {:<6} {:<20} {} ({} ms){}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    outcome,
                    record.server_name,
                    record.package_name,
                    record.duration_millis,
                    record
                        .error_message
                        .map(|message| format!(" - {message}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::CleanupHistory { days } => {
            let removed = service.cleanup_history(days)?;
            println!("Removed {removed} history record(s).");
        }
        Commands::Logs { task_id } => {
            let content = service.read_task_log(&task_id);
            if content.is_empty() {
                println!("No audit log for task `{task_id}` today.");
            } else {
                print!("{content}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn deploy(service: &DeploymentService, args: DeployArgs) -> Result<ExitCode> {
    let mut targets = Vec::with_capacity(args.servers.len());
    for name in &args.servers {
        let target = service
            .get_server_target(name)?
            .with_context(|| format!("Server target `{name}` not found"))?;
        targets.push(target);
    }

    let mut task = DeploymentTask::new(args.package, targets);
    task.files_to_move = args.files;
    task.create_backup = !args.no_backup;
    task.cleanup_after_deployment = !args.keep_temp;
    task.description = args.description;

    let results = Arc::new(Mutex::new(Vec::<DeploymentResult>::new()));
    let on_result = {
        let results = results.clone();
        Box::new(move |result: DeploymentResult| {
            if let Ok(mut results) = results.lock() {
                results.push(result);
            }
        })
    };

    let (handle, mut receiver) = service.execute_deployment_with_channel(task, on_result)?;
    println!("Task {} started.", handle.task_id());
    let printer = tokio::task::spawn_blocking(move || {
        while let Some(event) = receiver.recv() {
            println!("{event}");
        }
        receiver.dropped()
    });

    let status = handle.wait().await;
    let dropped = printer.await.unwrap_or(0);
    if dropped > 0 {
        println!("({dropped} progress message(s) dropped)");
    }

    let results = results
        .lock()
        .map(|results| results.clone())
        .unwrap_or_default();
    println!("Task {} {status}.", handle.task_id());
    let mut failed = 0;
    for result in &results {
        match &result.error_message {
            None if result.success => println!(
                "  OK      {:<20} {} file(s) deployed",
                result.server.name,
                result.deployed_files.len()
            ),
            message => {
                failed += 1;
                println!(
                    "  FAILED  {:<20} {}",
                    result.server.name,
                    message.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    if failed > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

impl ServerTargetArgs {
    fn into_target(self) -> ServerTarget {
        ServerTarget {
            port: self.port,
            password: self.password,
            private_key_path: self.key,
            private_key_passphrase: self.passphrase,
            upload_directory: self.upload_dir,
            install_directory: self.install_dir,
            backup_directory: self.backup_dir,
            enabled: !self.disabled,
            description: self.description,
            ..ServerTarget::new(self.name, self.host, self.user)
        }
    }
}
