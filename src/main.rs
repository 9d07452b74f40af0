//! nsworker — entry point
//!
//! All stdout is JSON only. Tracing logs go to stderr.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nsworker::schema::ErrorOutput;

#[derive(Debug, Parser)]
#[command(name = "nsworker")]
#[command(about = "Remote Linux job runner with namespace and cgroup isolation", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// Connection flags shared by every client sub-command.
#[derive(Debug, Args)]
struct ClientFlags {
    /// Server address as host:port.
    #[arg(long, default_value = "localhost:50051")]
    host: String,

    /// PEM client certificate.
    #[arg(long)]
    cert_path: String,

    /// PEM private key for the client certificate.
    #[arg(long)]
    cert_key_path: String,

    /// PEM certificate authority to verify the server against.
    #[arg(long)]
    ca_cert_path: String,
}

impl ClientFlags {
    fn connect_opts(&self) -> nsworker::client::ConnectOpts<'_> {
        nsworker::client::ConnectOpts {
            host: &self.host,
            cert_path: &self.cert_path,
            cert_key_path: &self.cert_key_path,
            ca_cert_path: &self.ca_cert_path,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker server.
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:50051")]
        listen: SocketAddr,

        /// PEM server certificate.
        #[arg(long)]
        cert_path: PathBuf,

        /// PEM private key for the server certificate.
        #[arg(long)]
        cert_key_path: PathBuf,

        /// PEM certificate authority client certificates must chain to.
        #[arg(long)]
        ca_cert_path: PathBuf,

        /// Override the isolation helper binary (default: this binary).
        #[arg(long)]
        helper_path: Option<String>,

        /// Override the parent directory for per-job cgroups.
        #[arg(long)]
        cgroup_root: Option<String>,

        /// Override the parent directory for per-job rootfs staging.
        #[arg(long)]
        rootfs_dir: Option<String>,

        /// Seconds between SIGTERM and SIGKILL on stop.
        #[arg(long, default_value = "5")]
        stop_grace_secs: u64,
    },

    /// Start a job on the server and print its identifier.
    Start {
        #[command(flatten)]
        client: ClientFlags,

        /// Command and arguments, after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a running job.
    Stop {
        #[command(flatten)]
        client: ClientFlags,

        /// Job identifier.
        #[arg(long)]
        worker_id: String,
    },

    /// Print a job's lifecycle status.
    GetStatus {
        #[command(flatten)]
        client: ClientFlags,

        /// Job identifier.
        #[arg(long)]
        worker_id: String,
    },

    /// Stream a job's output from the first byte until end-of-stream.
    StreamOutput {
        #[command(flatten)]
        client: ClientFlags,

        /// Job identifier.
        #[arg(long)]
        worker_id: String,
    },

    /// [Internal] Isolation helper — not for direct use.
    #[command(name = "_isolate", hide = true)]
    Isolate {
        #[arg(long)]
        job_id: String,

        #[arg(long)]
        cgroup_root: PathBuf,

        #[arg(long)]
        rootfs_dir: PathBuf,

        /// Set on the stage-two re-execution running as PID 1.
        #[arg(long)]
        pid1: bool,

        /// User command, after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() {
    let Cli { verbose, command } = Cli::parse();

    // The helper must not log: its stderr is the job's captured stderr.
    if let Command::Isolate {
        job_id,
        cgroup_root,
        rootfs_dir,
        pid1,
        command,
    } = &command
    {
        nsworker::isolate::execute(nsworker::isolate::IsolateOpts {
            job_id,
            cgroup_root,
            rootfs_dir,
            pid1: *pid1,
            command,
        });
    }

    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ErrorOutput {
                error: format!("start runtime: {e}"),
            }
            .print();
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(command)) {
        ErrorOutput {
            error: format!("{e:#}"),
        }
        .print();
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve {
            listen,
            cert_path,
            cert_key_path,
            ca_cert_path,
            helper_path,
            cgroup_root,
            rootfs_dir,
            stop_grace_secs,
        } => {
            let tls = nsworker::identity::server_tls_config(
                &cert_path,
                &cert_key_path,
                &ca_cert_path,
            )
            .context("server TLS setup")?;

            let mut config = nsworker::controller::ControllerConfig::resolve(
                helper_path.as_deref(),
                cgroup_root.as_deref(),
                rootfs_dir.as_deref(),
            );
            config.stop_grace = Duration::from_secs(stop_grace_secs);

            let controller = Arc::new(nsworker::controller::Controller::new(config));
            nsworker::server::serve(listen, tls, controller).await
        }

        Command::Start { client, command } => {
            nsworker::client::start(&client.connect_opts(), command).await
        }

        Command::Stop { client, worker_id } => {
            nsworker::client::stop(&client.connect_opts(), &worker_id).await
        }

        Command::GetStatus { client, worker_id } => {
            nsworker::client::get_status(&client.connect_opts(), &worker_id).await
        }

        Command::StreamOutput { client, worker_id } => {
            nsworker::client::stream_output(&client.connect_opts(), &worker_id).await
        }

        Command::Isolate { .. } => unreachable!("handled before the runtime starts"),
    }
}
