// rust/batch-core/src/distributed/context.rs

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::grpc::GrpcTransport;
use super::local::LocalTransport;
use super::transport::Transport;
use crate::config::{ClusterInfo, DistributedConfig};
use crate::error::{BatchError, Result};

/// A worker's place in the run and its collective primitives.
///
/// Constructed once per worker and passed to whatever needs to talk to the
/// other ranks. Every rank must issue the same sequence of collective calls;
/// a rank that never arrives blocks the others indefinitely.
pub struct DistributedContext {
    rank: u32,
    world_size: u32,
    local_rank: u32,
    transport: Option<Box<dyn Transport>>,
}

impl DistributedContext {
    /// # Errors
    ///
    /// Returns a configuration error if `rank` is not below `world_size` or
    /// the transport was built for a different rank or world size.
    pub fn new(rank: u32, world_size: u32, transport: Box<dyn Transport>) -> Result<Self> {
        ClusterInfo {
            rank,
            world_size,
            local_rank: 0,
            latest_checkpoint: None,
        }
        .validate()?;
        if (transport.rank(), transport.world_size()) != (rank, world_size) {
            return Err(BatchError::config(format!(
                "transport is rank {} of {}, context expects rank {rank} of {world_size}",
                transport.rank(),
                transport.world_size()
            )));
        }

        Ok(Self {
            rank,
            world_size,
            local_rank: 0,
            transport: (world_size > 1).then_some(transport),
        })
    }

    /// Context for a run with one worker; collectives never touch a transport.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            transport: None,
        }
    }

    /// Wraps one endpoint of a [`LocalFabric`](super::LocalFabric).
    pub fn from_local(transport: LocalTransport) -> Result<Self> {
        let (rank, world_size) = (transport.rank(), transport.world_size());
        Self::new(rank, world_size, Box::new(transport))
    }

    /// Builds the context a launcher describes, connecting over gRPC when
    /// there is more than one worker.
    pub fn from_cluster(cluster: &ClusterInfo, config: &DistributedConfig) -> Result<Self> {
        cluster.validate()?;
        let ctx = if cluster.world_size == 1 {
            Self::single()
        } else {
            let transport = GrpcTransport::connect(config, cluster.rank, cluster.world_size)?;
            Self::new(cluster.rank, cluster.world_size, Box::new(transport))?
        };
        Ok(ctx.with_local_rank(cluster.local_rank))
    }

    pub fn with_local_rank(mut self, local_rank: u32) -> Self {
        self.local_rank = local_rank;
        self
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn local_rank(&self) -> u32 {
        self.local_rank
    }

    pub fn is_chief(&self) -> bool {
        self.rank == 0
    }

    /// Collects one value from every rank. The chief gets them ordered by
    /// rank; other ranks get `None`.
    pub fn gather<T>(&self, value: &T) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        let Some(transport) = &self.transport else {
            return encode(value).and_then(|bytes| decode(&bytes)).map(|v| Some(vec![v]));
        };

        match transport.gather(encode(value)?)? {
            Some(payloads) => payloads
                .iter()
                .map(|bytes| decode(bytes))
                .collect::<Result<Vec<T>>>()
                .map(Some),
            None => Ok(None),
        }
    }

    /// Distributes the chief's value to every rank. Values passed by other
    /// ranks are ignored.
    ///
    /// # Errors
    ///
    /// Returns a collective error if the chief passes `None`.
    pub fn broadcast<T>(&self, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        if self.is_chief() && value.is_none() {
            return Err(BatchError::collective(
                self.rank,
                "chief must supply the broadcast value",
            ));
        }
        let Some(transport) = &self.transport else {
            return value.ok_or_else(|| {
                BatchError::collective(self.rank, "chief must supply the broadcast value")
            });
        };

        let payload = match value {
            Some(v) if self.is_chief() => Some(encode(&v)?),
            _ => None,
        };
        decode(&transport.broadcast(payload)?)
    }

    /// Gathers to the chief, then hands the full list to every rank.
    pub fn allgather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let gathered = self.gather(value)?;
        self.broadcast(gathered)
    }

    /// Returns once every rank has reached the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.gather(&()).map(|_| ())
    }
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("local_rank", &self.local_rank)
            .finish()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| BatchError::serialization(format!("failed to encode collective value: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| BatchError::serialization(format!("failed to decode collective value: {e}")))
}
