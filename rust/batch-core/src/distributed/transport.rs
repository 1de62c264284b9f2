// rust/batch-core/src/distributed/transport.rs

use crate::error::{BatchError, Result};

/// Moves opaque payloads between ranks for the two collective primitives.
///
/// Implementations are only called with `world_size >= 2`; the context
/// short-circuits single-worker runs. Every rank must make the same sequence
/// of calls.
pub trait Transport: Send {
    fn rank(&self) -> u32;

    fn world_size(&self) -> u32;

    /// Sends `payload` to the chief. The chief receives every rank's payload
    /// ordered by rank (its own first) and workers receive `None`. Workers
    /// return only after the chief has collected all payloads.
    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>>;

    /// The chief passes `Some(payload)` and every rank returns it. Workers
    /// pass `None`.
    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>>;
}

/// Messages exchanged over the in-process fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Gather { rank: u32, payload: Vec<u8> },
    Ack,
    Broadcast { payload: Vec<u8> },
}

impl Frame {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Frame::Gather { .. } => "gather",
            Frame::Ack => "ack",
            Frame::Broadcast { .. } => "broadcast",
        }
    }

    pub(crate) fn unexpected(&self, rank: u32, expected: &str) -> BatchError {
        BatchError::collective(
            rank,
            format!(
                "expected {expected} frame, received {}; ranks have diverged",
                self.kind()
            ),
        )
    }
}

/// Orders gathered payloads by rank and checks that every rank reported
/// exactly once.
#[derive(Debug)]
pub(crate) struct GatherSlots {
    chief_rank: u32,
    slots: Vec<Option<Vec<u8>>>,
}

impl GatherSlots {
    pub(crate) fn new(world_size: u32) -> Self {
        Self {
            chief_rank: 0,
            slots: vec![None; world_size as usize],
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub(crate) fn insert(&mut self, rank: u32, payload: Vec<u8>) -> Result<()> {
        let slot = self.slots.get_mut(rank as usize).ok_or_else(|| {
            BatchError::collective(self.chief_rank, format!("gather from unknown rank {rank}"))
        })?;
        if slot.is_some() {
            return Err(BatchError::collective(
                self.chief_rank,
                format!("rank {rank} contributed twice to one gather"),
            ));
        }
        *slot = Some(payload);
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Vec<Vec<u8>>> {
        let chief_rank = self.chief_rank;
        self.slots
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.ok_or_else(|| {
                    BatchError::collective(chief_rank, format!("rank {rank} missing from gather"))
                })
            })
            .collect()
    }
}
