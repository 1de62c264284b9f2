// rust/batch-core/src/distributed/grpc.rs

//! gRPC transport for workers in separate processes.
//!
//! The chief hosts the collective service on its own small tokio runtime;
//! workers call it through a blocking client. Either side blocks the calling
//! thread with `Runtime::block_on`, so the rest of the crate stays
//! synchronous.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tracing::{debug, info, warn};

use super::service::proto::collective_client::CollectiveClient;
use super::service::proto::collective_server::CollectiveServer;
use super::service::{Board, BroadcastRequest, CollectiveService, GatherRequest, JoinRequest};
use super::transport::Transport;
use crate::config::DistributedConfig;
use crate::error::{BatchError, Result};

/// Upper bound on a single collective payload.
const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Upper bound on the delay between connection attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How long a departing chief waits for workers to collect posted values.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

enum Role {
    Chief {
        board: Arc<watch::Sender<Board>>,
        shutdown: Option<oneshot::Sender<()>>,
        server: Option<JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
    },
    Worker {
        client: CollectiveClient<Channel>,
    },
}

pub struct GrpcTransport {
    rank: u32,
    world_size: u32,
    runtime: Runtime,
    role: Role,
    gather_round: AtomicU64,
    broadcast_round: AtomicU64,
}

impl GrpcTransport {
    /// Sets up the transport for `rank`: the chief binds and serves, workers
    /// connect with retry.
    pub fn connect(config: &DistributedConfig, rank: u32, world_size: u32) -> Result<Self> {
        let addr = format!("{}:{}", config.chief_addr, config.port);
        if rank == 0 {
            let listener = TcpListener::bind(&addr).map_err(|e| {
                BatchError::collective_with_source(rank, format!("failed to bind {addr}"), e)
            })?;
            info!(addr = %addr, world_size, "chief serving collectives");
            Self::serve(listener, world_size)
        } else {
            Self::join(
                &addr,
                rank,
                world_size,
                config.connect_attempts,
                Duration::from_millis(config.connect_retry_delay_ms),
            )
        }
    }

    /// Serves the collective service for `world_size - 1` workers on an
    /// already bound listener.
    pub fn serve(listener: TcpListener, world_size: u32) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("batch-collective")
            .enable_all()
            .build()
            .map_err(|e| BatchError::collective_with_source(0, "failed to start runtime", e))?;

        let incoming = listener
            .set_nonblocking(true)
            .and_then(|()| {
                let _guard = runtime.enter();
                tokio::net::TcpListener::from_std(listener)
            })
            .map_err(|e| BatchError::collective_with_source(0, "failed to adopt listener", e))?;

        let (board, _) = watch::channel(Board::new(world_size));
        let board = Arc::new(board);
        let service = CollectiveServer::new(CollectiveService::new(Arc::clone(&board)))
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = runtime.spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(incoming), async {
                    let _ = shutdown_rx.await;
                }),
        );

        Ok(Self {
            rank: 0,
            world_size,
            runtime,
            role: Role::Chief {
                board,
                shutdown: Some(shutdown_tx),
                server: Some(server),
            },
            gather_round: AtomicU64::new(0),
            broadcast_round: AtomicU64::new(0),
        })
    }

    /// Connects to the chief, retrying with a doubling delay, and announces
    /// this worker's rank and world size.
    pub fn join(
        addr: &str,
        rank: u32,
        world_size: u32,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BatchError::collective_with_source(rank, "failed to start runtime", e))?;

        let endpoint = Endpoint::from_shared(format!("http://{addr}")).map_err(|e| {
            BatchError::config_with_source(format!("invalid chief address '{addr}'"), e)
        })?;
        let channel =
            runtime.block_on(connect_with_retry(&endpoint, rank, attempts, retry_delay))?;
        let mut client = CollectiveClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);

        runtime
            .block_on(client.join(JoinRequest { rank, world_size }))
            .map_err(|s| BatchError::collective_with_source(rank, "chief rejected worker", s))?;
        debug!(rank, addr, "joined chief");

        Ok(Self {
            rank,
            world_size,
            runtime,
            role: Role::Worker { client },
            gather_round: AtomicU64::new(0),
            broadcast_round: AtomicU64::new(0),
        })
    }
}

async fn connect_with_retry(
    endpoint: &Endpoint,
    rank: u32,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Channel> {
    let mut delay = retry_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(e) if attempt >= attempts.max(1) => {
                return Err(BatchError::collective_with_source(
                    rank,
                    format!(
                        "failed to reach chief at {} after {attempt} attempts",
                        endpoint.uri()
                    ),
                    e,
                ));
            }
            Err(e) => {
                warn!(rank, attempt, error = %e, "chief not reachable yet, retrying");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
            }
        }
    }
}

impl Transport for GrpcTransport {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        let round = self.gather_round.fetch_add(1, Ordering::SeqCst);
        match &self.role {
            Role::Chief { board, .. } => {
                let mut contributed = Ok(());
                board.send_modify(|b| contributed = b.contribute(round, self.rank, payload));
                contributed?;

                let mut rx = board.subscribe();
                self.runtime
                    .block_on(rx.wait_for(|b| b.gather_complete(round)))
                    .map(drop)
                    .map_err(|e| BatchError::collective_with_source(self.rank, "board closed", e))?;

                let mut gathered = Ok(Vec::new());
                board.send_modify(|b| gathered = b.complete_gather(round));
                gathered.map(Some)
            }
            Role::Worker { client } => {
                let mut client = client.clone();
                let request = GatherRequest {
                    rank: self.rank,
                    round,
                    payload,
                };
                self.runtime
                    .block_on(client.gather(request))
                    .map_err(|s| BatchError::collective_with_source(self.rank, "gather failed", s))?;
                Ok(None)
            }
        }
    }

    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let round = self.broadcast_round.fetch_add(1, Ordering::SeqCst);
        match &self.role {
            Role::Chief { board, .. } => {
                let payload = payload.ok_or_else(|| {
                    BatchError::collective(self.rank, "chief must supply the broadcast value")
                })?;
                board.send_modify(|b| b.post(round, payload.clone()));
                Ok(payload)
            }
            Role::Worker { client } => {
                let mut client = client.clone();
                let request = BroadcastRequest {
                    rank: self.rank,
                    round,
                };
                let reply = self
                    .runtime
                    .block_on(client.broadcast(request))
                    .map_err(|s| {
                        BatchError::collective_with_source(self.rank, "broadcast failed", s)
                    })?;
                Ok(reply.into_inner().payload)
            }
        }
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        let Role::Chief {
            board,
            shutdown,
            server,
        } = &mut self.role
        else {
            return;
        };

        // Workers may not have fetched the last broadcast yet
        let mut rx = board.subscribe();
        let drained = self.runtime.block_on(async {
            tokio::time::timeout(SHUTDOWN_GRACE, rx.wait_for(Board::drained))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
        });
        if !drained {
            warn!("stopping collective service with undelivered broadcasts");
        }

        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = server.take() {
            let stopped = self
                .runtime
                .block_on(async { tokio::time::timeout(SHUTDOWN_GRACE, server).await });
            match stopped {
                Ok(Ok(Ok(()))) => debug!("collective service stopped"),
                Ok(Ok(Err(e))) => warn!(error = %e, "collective service failed"),
                Ok(Err(e)) => warn!(error = %e, "collective service task failed"),
                Err(_) => warn!("collective service did not stop in time"),
            }
        }
    }
}
