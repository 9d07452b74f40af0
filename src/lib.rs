/// nsworker — core library
///
/// Runs user commands as isolated jobs: fresh PID, mount, and network
/// namespaces, a per-job cgroup with cpu/memory/io caps, captured output
/// with replay-from-zero streaming, and ownership tied to the mTLS peer
/// identity. Exposed over gRPC by `serve`; driven by the client
/// sub-commands `start`, `stop`, `get-status`, and `stream-output`.
pub mod cgroup;
pub mod client;
pub mod controller;
pub mod errors;
pub mod identity;
pub mod isolate;
pub mod output;
pub mod schema;
pub mod server;
pub mod store;

/// Generated gRPC types for the `worker.v1` wire contract.
pub mod pb {
    tonic::include_proto!("worker.v1");
}
