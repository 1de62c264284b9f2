// rust/batch-core/src/distributed/service.rs

//! gRPC service the chief hosts for workers in other processes.
//!
//! Collective calls are numbered per kind on every rank, so the n-th gather
//! of a worker meets the n-th gather of the chief on the shared [`Board`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::debug;

use super::transport::GatherSlots;
use crate::error::{BatchError, Result};

#[allow(clippy::all)]
pub(crate) mod proto {
    include!(concat!(env!("OUT_DIR"), "/batch_core.collective.Collective.rs"));
}

use proto::collective_server::Collective;

#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinRequest {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(uint32, tag = "2")]
    pub world_size: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatherRequest {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(uint64, tag = "2")]
    pub round: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GatherReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BroadcastRequest {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(uint64, tag = "2")]
    pub round: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BroadcastReply {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

/// A broadcast value waiting for the workers that have not fetched it yet.
#[derive(Debug)]
struct Posted {
    payload: Vec<u8>,
    remaining: u32,
}

/// Collective state shared by the chief's transport and the RPC handlers.
#[derive(Debug)]
pub(crate) struct Board {
    world_size: u32,
    joined: BTreeSet<u32>,
    gathers: BTreeMap<u64, GatherSlots>,
    gathers_done: u64,
    broadcasts: BTreeMap<u64, Posted>,
}

impl Board {
    pub(crate) fn new(world_size: u32) -> Self {
        Self {
            world_size,
            joined: BTreeSet::new(),
            gathers: BTreeMap::new(),
            gathers_done: 0,
            broadcasts: BTreeMap::new(),
        }
    }

    fn join(&mut self, rank: u32, world_size: u32) -> Result<()> {
        if world_size != self.world_size {
            return Err(BatchError::config(format!(
                "rank {rank} was started with world size {world_size}, the chief with {}",
                self.world_size
            )));
        }
        if rank == 0 || rank >= self.world_size {
            return Err(BatchError::config(format!(
                "invalid worker rank {rank} for world size {world_size}"
            )));
        }
        if !self.joined.insert(rank) {
            return Err(BatchError::collective(0, format!("rank {rank} joined twice")));
        }
        Ok(())
    }

    pub(crate) fn contribute(&mut self, round: u64, rank: u32, payload: Vec<u8>) -> Result<()> {
        if round < self.gathers_done {
            return Err(BatchError::collective(
                0,
                format!("rank {rank} sent gather {round} after it completed"),
            ));
        }
        let world_size = self.world_size;
        self.gathers
            .entry(round)
            .or_insert_with(|| GatherSlots::new(world_size))
            .insert(rank, payload)
    }

    pub(crate) fn gather_complete(&self, round: u64) -> bool {
        self.gathers.get(&round).is_some_and(GatherSlots::is_complete)
    }

    /// Takes the payloads of `round` and releases the workers waiting on it.
    pub(crate) fn complete_gather(&mut self, round: u64) -> Result<Vec<Vec<u8>>> {
        let slots = self.gathers.remove(&round).ok_or_else(|| {
            BatchError::collective(0, format!("gather {round} has no contributions"))
        })?;
        self.gathers_done = round + 1;
        slots.finish()
    }

    pub(crate) fn post(&mut self, round: u64, payload: Vec<u8>) {
        let remaining = self.world_size.saturating_sub(1);
        if remaining > 0 {
            self.broadcasts.insert(round, Posted { payload, remaining });
        }
    }

    /// True once every worker has fetched every posted value.
    pub(crate) fn drained(&self) -> bool {
        self.broadcasts.is_empty()
    }

    fn fetch(&mut self, round: u64) -> Option<Vec<u8>> {
        let posted = self.broadcasts.get_mut(&round)?;
        posted.remaining -= 1;
        if posted.remaining == 0 {
            return self.broadcasts.remove(&round).map(|p| p.payload);
        }
        Some(posted.payload.clone())
    }
}

fn rejected(err: BatchError) -> Status {
    Status::invalid_argument(err.to_string())
}

fn chief_gone(_: watch::error::RecvError) -> Status {
    Status::unavailable("chief stopped serving collectives")
}

pub(crate) struct CollectiveService {
    board: Arc<watch::Sender<Board>>,
}

impl CollectiveService {
    pub(crate) fn new(board: Arc<watch::Sender<Board>>) -> Self {
        Self { board }
    }
}

#[tonic::async_trait]
impl Collective for CollectiveService {
    async fn join(
        &self,
        request: Request<JoinRequest>,
    ) -> std::result::Result<Response<JoinReply>, Status> {
        let req = request.into_inner();
        let mut joined = Ok(());
        self.board
            .send_modify(|board| joined = board.join(req.rank, req.world_size));
        joined.map_err(rejected)?;

        debug!(rank = req.rank, "worker joined");
        Ok(Response::new(JoinReply {}))
    }

    async fn gather(
        &self,
        request: Request<GatherRequest>,
    ) -> std::result::Result<Response<GatherReply>, Status> {
        let GatherRequest {
            rank,
            round,
            payload,
        } = request.into_inner();
        if rank == 0 {
            return Err(Status::invalid_argument("rank 0 does not gather over rpc"));
        }

        let mut contributed = Ok(());
        self.board
            .send_modify(|board| contributed = board.contribute(round, rank, payload));
        contributed.map_err(rejected)?;

        // Reply only once the chief holds every payload of this round
        let mut rx = self.board.subscribe();
        rx.wait_for(|board| board.gathers_done > round)
            .await
            .map(drop)
            .map_err(chief_gone)?;
        Ok(Response::new(GatherReply {}))
    }

    async fn broadcast(
        &self,
        request: Request<BroadcastRequest>,
    ) -> std::result::Result<Response<BroadcastReply>, Status> {
        let BroadcastRequest { rank, round } = request.into_inner();

        let mut rx = self.board.subscribe();
        rx.wait_for(|board| board.broadcasts.contains_key(&round))
            .await
            .map(drop)
            .map_err(chief_gone)?;

        let mut payload = None;
        self.board.send_modify(|board| payload = board.fetch(round));
        let payload = payload.ok_or_else(|| {
            Status::failed_precondition(format!(
                "broadcast {round} was already fetched by every worker (rank {rank})"
            ))
        })?;
        Ok(Response::new(BroadcastReply { payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_checks_world_size_and_rank() {
        let mut board = Board::new(3);
        assert!(board.join(1, 2).unwrap_err().is_config());
        assert!(board.join(0, 3).unwrap_err().is_config());
        assert!(board.join(3, 3).unwrap_err().is_config());

        board.join(2, 3).unwrap();
        assert!(board.join(2, 3).is_err());
    }

    #[test]
    fn test_gather_rounds_complete_in_order() {
        let mut board = Board::new(2);
        board.contribute(0, 1, vec![1]).unwrap();
        assert!(!board.gather_complete(0));
        board.contribute(0, 0, vec![0]).unwrap();
        assert!(board.gather_complete(0));

        // Rounds are kept apart by number
        board.contribute(1, 1, vec![11]).unwrap();
        assert_eq!(board.complete_gather(0).unwrap(), vec![vec![0], vec![1]]);
        assert!(board.contribute(0, 1, vec![1]).is_err());
        assert!(!board.gather_complete(1));
    }

    #[test]
    fn test_broadcast_dropped_after_every_worker_fetched() {
        let mut board = Board::new(3);
        board.post(0, b"seed".to_vec());
        assert!(!board.drained());

        assert_eq!(board.fetch(0).unwrap(), b"seed");
        assert!(!board.drained());
        assert_eq!(board.fetch(0).unwrap(), b"seed");
        assert!(board.drained());
        assert!(board.fetch(0).is_none());
    }
}
