//! CLI client commands: `start`, `stop`, `get-status`, `stream-output`.
//!
//! Each command dials the server over mutually-authenticated TLS, performs
//! one RPC, and prints a single JSON object on stdout (`stream-output`
//! prints one object per chunk). The client's certificate is its identity;
//! nothing identity-like is sent in the request itself.

use anyhow::{Context, Result, anyhow};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::debug;

use crate::pb::job_worker_client::JobWorkerClient;
use crate::pb::{GetStatusRequest, StartRequest, StopRequest, StreamOutputRequest};
use crate::schema::{StartOutput, StatusOutput, StopOutput, StreamLine};

/// Connection settings shared by every client command.
#[derive(Debug)]
pub struct ConnectOpts<'a> {
    /// `host:port` of the worker server.
    pub host: &'a str,
    /// PEM client certificate presented to the server.
    pub cert_path: &'a str,
    /// PEM private key for the client certificate.
    pub cert_key_path: &'a str,
    /// PEM certificate authority the server is verified against.
    pub ca_cert_path: &'a str,
}

async fn connect(opts: &ConnectOpts<'_>) -> Result<JobWorkerClient<Channel>> {
    let cert = std::fs::read(opts.cert_path)
        .with_context(|| format!("read client certificate {}", opts.cert_path))?;
    let key = std::fs::read(opts.cert_key_path)
        .with_context(|| format!("read client key {}", opts.cert_key_path))?;
    let ca = std::fs::read(opts.ca_cert_path)
        .with_context(|| format!("read CA certificate {}", opts.ca_cert_path))?;

    // TLS server name: the host part of host:port.
    let domain = opts
        .host
        .rsplit_once(':')
        .map(|(name, _port)| name)
        .unwrap_or(opts.host);

    let tls = ClientTlsConfig::new()
        .domain_name(domain)
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));

    debug!(host = %opts.host, "dialing worker server");
    let channel = Channel::from_shared(format!("https://{}", opts.host))
        .with_context(|| format!("invalid host {}", opts.host))?
        .tls_config(tls)
        .context("client TLS config")?
        .connect()
        .await
        .with_context(|| format!("connect to {}", opts.host))?;
    Ok(JobWorkerClient::new(channel))
}

/// Surface an RPC failure as the server's message only; the status code is
/// implied by it ("job not found or not authorized", "empty command", ...).
fn rpc_error(status: tonic::Status) -> anyhow::Error {
    anyhow!("{}", status.message())
}

/// `start -- <command...>`: launch a job, print its identifier.
pub async fn start(opts: &ConnectOpts<'_>, command: Vec<String>) -> Result<()> {
    let mut client = connect(opts).await?;
    let response = client
        .start(StartRequest { command })
        .await
        .map_err(rpc_error)?
        .into_inner();
    StartOutput {
        worker_id: response.worker_id,
    }
    .print();
    Ok(())
}

/// `stop --worker-id <id>`: request termination.
pub async fn stop(opts: &ConnectOpts<'_>, worker_id: &str) -> Result<()> {
    let mut client = connect(opts).await?;
    client
        .stop(StopRequest {
            worker_id: worker_id.to_string(),
        })
        .await
        .map_err(rpc_error)?;
    StopOutput {
        worker_id: worker_id.to_string(),
        stopped: true,
    }
    .print();
    Ok(())
}

/// `get-status --worker-id <id>`: print a lifecycle snapshot.
pub async fn get_status(opts: &ConnectOpts<'_>, worker_id: &str) -> Result<()> {
    let mut client = connect(opts).await?;
    let status = client
        .get_status(GetStatusRequest {
            worker_id: worker_id.to_string(),
        })
        .await
        .map_err(rpc_error)?
        .into_inner();
    StatusOutput {
        worker_id: worker_id.to_string(),
        done: status.done,
        state: status.state,
        exit_code: status.exit_code,
        pid: status.pid,
    }
    .print();
    Ok(())
}

/// `stream-output --worker-id <id>`: print each chunk as a JSON line until
/// the server closes the stream or the user interrupts.
pub async fn stream_output(opts: &ConnectOpts<'_>, worker_id: &str) -> Result<()> {
    let mut client = connect(opts).await?;
    let mut stream = client
        .stream_output(StreamOutputRequest {
            worker_id: worker_id.to_string(),
        })
        .await
        .map_err(rpc_error)?
        .into_inner();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted, closing stream");
                return Ok(());
            }
            message = stream.message() => {
                match message.map_err(rpc_error)? {
                    None => return Ok(()),
                    Some(chunk) => {
                        if let Some(bytes) = chunk.stdout_chunk {
                            StreamLine {
                                stdout: Some(String::from_utf8_lossy(&bytes).into_owned()),
                                stderr: None,
                            }
                            .print();
                        }
                        if let Some(bytes) = chunk.stderr_chunk {
                            StreamLine {
                                stdout: None,
                                stderr: Some(String::from_utf8_lossy(&bytes).into_owned()),
                            }
                            .print();
                        }
                    }
                }
            }
        }
    }
}
