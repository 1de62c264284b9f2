// rust/batch-core/src/distributed/mod.rs

//! Collective communication between ranks.
//!
//! [`DistributedContext`] exposes `gather` and `broadcast` (plus `allgather`
//! and `barrier` built on them) over a pluggable [`Transport`]. The chief,
//! rank 0, is the only rank that receives gathered values and the only rank
//! that supplies broadcast values.
//!
//! Transports:
//!
//! - [`LocalFabric`]: ranks as threads of one process, over channels.
//! - [`GrpcTransport`]: ranks as separate processes; the chief serves a
//!   gRPC collective service on `distributed.chief_addr:port` and workers
//!   call it.

mod context;
mod grpc;
mod local;
mod service;
mod transport;

pub use context::DistributedContext;
pub use grpc::GrpcTransport;
pub use local::{LocalFabric, LocalTransport};
pub use transport::Transport;
