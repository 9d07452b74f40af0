//! gRPC surface: the `JobWorker` service implementation and the
//! mutually-authenticated accept loop.
//!
//! The TLS handshake is the outer gate: connections without a valid client
//! certificate fail before any service code runs. Accepted streams flow
//! into tonic with their peer certificates attached, and every handler
//! resolves the requester through the identity gate before touching the
//! controller.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::identity;
use crate::output::LogReader;
use crate::pb::job_worker_server::{JobWorker, JobWorkerServer};
use crate::pb::{
    GetStatusRequest, GetStatusResponse, OutputChunk, StartRequest, StartResponse, StopRequest,
    StopResponse, StreamOutputRequest,
};

/// Buffered chunks per output stream before backpressure.
const STREAM_CHANNEL_CAPACITY: usize = 16;

pub struct WorkerService {
    controller: Arc<Controller>,
}

impl WorkerService {
    pub fn new(controller: Arc<Controller>) -> Self {
        WorkerService { controller }
    }
}

#[tonic::async_trait]
impl JobWorker for WorkerService {
    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let owner = identity::require_owner(&request)?;
        let command = request.into_inner().command;
        let worker_id = self.controller.start(&owner, command).await?;
        Ok(Response::new(StartResponse { worker_id }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let owner = identity::require_owner(&request)?;
        let id = request.into_inner().worker_id;
        self.controller.stop(&owner, &id)?;
        Ok(Response::new(StopResponse {}))
    }

    async fn get_status(
        &self,
        request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let owner = identity::require_owner(&request)?;
        let id = request.into_inner().worker_id;
        let snap = self.controller.status(&owner, &id)?;
        Ok(Response::new(GetStatusResponse {
            done: snap.done,
            state: snap.state.to_string(),
            exit_code: snap.exit_code,
            pid: snap.pid,
        }))
    }

    type StreamOutputStream = ReceiverStream<Result<OutputChunk, Status>>;

    async fn stream_output(
        &self,
        request: Request<StreamOutputRequest>,
    ) -> Result<Response<Self::StreamOutputStream>, Status> {
        let owner = identity::require_owner(&request)?;
        let id = request.into_inner().worker_id;
        let (stdout, stderr) = self.controller.output(&owner, &id)?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(forward(stdout, tx.clone(), true));
        tokio::spawn(forward(stderr, tx, false));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Forward one log's bytes into the response channel as labelled chunks.
/// Ends when the log is drained and closed, or when the client goes away
/// (the channel closes and the reader detaches via drop).
async fn forward(
    mut reader: LogReader,
    tx: mpsc::Sender<Result<OutputChunk, Status>>,
    is_stdout: bool,
) {
    while let Some(bytes) = reader.next_chunk().await {
        let chunk = if is_stdout {
            OutputChunk {
                stdout_chunk: Some(bytes),
                stderr_chunk: None,
            }
        } else {
            OutputChunk {
                stdout_chunk: None,
                stderr_chunk: Some(bytes),
            }
        };
        if tx.send(Ok(chunk)).await.is_err() {
            debug!("output stream client went away");
            break;
        }
    }
}

/// Bind and serve until the process exits.
pub async fn serve(
    listen: SocketAddr,
    tls: rustls::ServerConfig,
    controller: Arc<Controller>,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    let addr = listener.local_addr().context("local addr")?;
    info!(%addr, "worker server listening");
    serve_on(listener, tls, controller).await
}

/// Serve on an already-bound listener (tests bind to an ephemeral port
/// first).
pub async fn serve_on(
    listener: TcpListener,
    tls: rustls::ServerConfig,
    controller: Arc<Controller>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(tls));
    let (tx, rx) = mpsc::channel::<std::io::Result<tokio_rustls::server::TlsStream<TcpStream>>>(
        STREAM_CHANNEL_CAPACITY,
    );

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                // Handshakes run off the accept loop so one slow or
                // unauthenticated peer cannot stall the rest.
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let _ = tx.send(Ok(tls_stream)).await;
                    }
                    Err(e) => {
                        // Covers missing and untrusted client certificates;
                        // no request handling happens for these peers.
                        warn!(peer = %peer, error = %e, "tls handshake rejected");
                    }
                }
            });
        }
    });

    Server::builder()
        .add_service(JobWorkerServer::new(WorkerService::new(controller)))
        .serve_with_incoming(ReceiverStream::new(rx))
        .await
        .context("serve grpc")
}
