// rust/batch-core/src/distributed/local.rs

//! In-process transport: one endpoint per rank, connected by `crossbeam`
//! channels. Ranks run as threads of the same process.

use crossbeam::channel::{unbounded, Receiver, Sender};

use super::transport::{Frame, GatherSlots, Transport};
use crate::error::{BatchError, Result};

/// Builds connected endpoints for an in-process run.
pub struct LocalFabric;

impl LocalFabric {
    /// Returns one transport per rank, indexed by rank. A `world_size` of
    /// zero yields no endpoints.
    pub fn new(world_size: u32) -> Vec<LocalTransport> {
        if world_size == 0 {
            return Vec::new();
        }

        let (up_tx, up_rx) = unbounded();
        let mut down_txs = Vec::with_capacity(world_size as usize - 1);
        let mut workers = Vec::with_capacity(world_size as usize - 1);

        for rank in 1..world_size {
            let (down_tx, down_rx) = unbounded();
            down_txs.push(down_tx);
            workers.push(LocalTransport {
                rank,
                world_size,
                role: Role::Worker {
                    up: up_tx.clone(),
                    down: down_rx,
                },
            });
        }
        // The chief holds no upstream sender, so losing every worker
        // disconnects its receiver.
        drop(up_tx);

        let mut endpoints = Vec::with_capacity(world_size as usize);
        endpoints.push(LocalTransport {
            rank: 0,
            world_size,
            role: Role::Chief {
                up: up_rx,
                down: down_txs,
            },
        });
        endpoints.extend(workers);
        endpoints
    }
}

enum Role {
    Chief {
        up: Receiver<Frame>,
        down: Vec<Sender<Frame>>,
    },
    Worker {
        up: Sender<Frame>,
        down: Receiver<Frame>,
    },
}

pub struct LocalTransport {
    rank: u32,
    world_size: u32,
    role: Role,
}

impl LocalTransport {
    fn disconnected(&self) -> BatchError {
        BatchError::collective(self.rank, "peer disconnected from local fabric")
    }

    fn send_all(&self, down: &[Sender<Frame>], frame: &Frame) -> Result<()> {
        for tx in down {
            tx.send(frame.clone()).map_err(|_| self.disconnected())?;
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        match &self.role {
            Role::Chief { up, down } => {
                let mut slots = GatherSlots::new(self.world_size);
                slots.insert(self.rank, payload)?;
                for _ in 1..self.world_size {
                    match up.recv().map_err(|_| self.disconnected())? {
                        Frame::Gather { rank, payload } => slots.insert(rank, payload)?,
                        other => return Err(other.unexpected(self.rank, "gather")),
                    }
                }
                let gathered = slots.finish()?;
                self.send_all(down, &Frame::Ack)?;
                Ok(Some(gathered))
            }
            Role::Worker { up, down } => {
                up.send(Frame::Gather {
                    rank: self.rank,
                    payload,
                })
                .map_err(|_| self.disconnected())?;
                match down.recv().map_err(|_| self.disconnected())? {
                    Frame::Ack => Ok(None),
                    other => Err(other.unexpected(self.rank, "ack")),
                }
            }
        }
    }

    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        match &self.role {
            Role::Chief { down, .. } => {
                let payload = payload.ok_or_else(|| {
                    BatchError::collective(self.rank, "chief must supply the broadcast value")
                })?;
                self.send_all(
                    down,
                    &Frame::Broadcast {
                        payload: payload.clone(),
                    },
                )?;
                Ok(payload)
            }
            Role::Worker { down, .. } => match down.recv().map_err(|_| self.disconnected())? {
                Frame::Broadcast { payload } => Ok(payload),
                other => Err(other.unexpected(self.rank, "broadcast")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<F, R>(world_size: u32, f: F) -> Vec<R>
    where
        F: Fn(LocalTransport) -> R + Send + Sync + Copy + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = LocalFabric::new(world_size)
            .into_iter()
            .map(|t| thread::spawn(move || f(t)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_fabric_endpoints_by_rank() {
        let endpoints = LocalFabric::new(3);
        let ranks: Vec<u32> = endpoints.iter().map(|t| t.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(endpoints.iter().all(|t| t.world_size() == 3));
        assert!(LocalFabric::new(0).is_empty());
    }

    #[test]
    fn test_gather_orders_by_rank() {
        let results = run_ranks(4, |t| t.gather(vec![t.rank() as u8 * 10]).unwrap());

        assert_eq!(
            results[0],
            Some(vec![vec![0], vec![10], vec![20], vec![30]])
        );
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[test]
    fn test_broadcast_then_gather_sequence() {
        let results = run_ranks(3, |t| {
            let seed = if t.rank() == 0 { Some(b"uuid".to_vec()) } else { None };
            let got = t.broadcast(seed).unwrap();
            let gathered = t.gather(vec![t.rank() as u8]).unwrap();
            let again = t.broadcast((t.rank() == 0).then(|| b"done".to_vec())).unwrap();
            (got, gathered, again)
        });

        for (got, _, again) in &results {
            assert_eq!(got, b"uuid");
            assert_eq!(again, b"done");
        }
        assert_eq!(results[0].1, Some(vec![vec![0], vec![1], vec![2]]));
    }

    #[test]
    fn test_chief_broadcast_requires_value() {
        let mut endpoints = LocalFabric::new(2);
        let chief = endpoints.remove(0);
        assert!(chief.broadcast(None).is_err());
    }

    #[test]
    fn test_worker_sees_chief_exit() {
        let mut endpoints = LocalFabric::new(2);
        let worker = endpoints.pop().unwrap();
        drop(endpoints);

        let err = worker.broadcast(None).unwrap_err();
        assert!(matches!(err, BatchError::Collective { rank: 1, .. }));
    }

    #[test]
    fn test_chief_sees_all_workers_exit() {
        let mut endpoints = LocalFabric::new(3);
        let chief = endpoints.remove(0);
        drop(endpoints);

        assert!(chief.gather(Vec::new()).is_err());
    }
}
