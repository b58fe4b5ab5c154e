use std::ops::Range;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use anyhow::{Result, anyhow, ensure};
use candle_core::Tensor;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpInfo {
    pub rank: usize,
    pub world_size: usize,
}

impl TpInfo {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        ensure!(
            world_size > 0,
            "tensor parallel world_size must be positive"
        );
        ensure!(
            rank < world_size,
            "tensor parallel rank must be in [0, world_size)"
        );
        Ok(Self { rank, world_size })
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

/// Point-to-point channel between tensor-parallel ranks. Collectives are built
/// on top of `send`/`recv` and keep the caller's stream order.
pub trait Communicator: std::fmt::Debug + Send + Sync {
    fn info(&self) -> TpInfo;

    fn send(&self, tensor: &Tensor, peer: usize) -> Result<()>;

    fn recv(&self, peer: usize) -> Result<Tensor>;

    fn rank(&self) -> usize {
        self.info().rank
    }

    fn world_size(&self) -> usize {
        self.info().world_size
    }

    /// Sums `x` over all ranks. Rank 0 reduces in rank order and broadcasts the
    /// result, so every rank ends up with the same bits.
    fn all_reduce_sum(&self, x: &Tensor) -> Result<Tensor> {
        let info = self.info();
        if info.world_size == 1 {
            return Ok(x.clone());
        }
        if info.is_primary() {
            let mut sum = x.clone();
            for peer in 1..info.world_size {
                let part = self.recv(peer)?.to_device(x.device())?;
                sum = (sum + part)?;
            }
            for peer in 1..info.world_size {
                self.send(&sum, peer)?;
            }
            Ok(sum)
        } else {
            self.send(x, 0)?;
            Ok(self.recv(0)?.to_device(x.device())?)
        }
    }
}

/// Single-rank communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn info(&self) -> TpInfo {
        TpInfo {
            rank: 0,
            world_size: 1,
        }
    }

    fn send(&self, _tensor: &Tensor, peer: usize) -> Result<()> {
        Err(anyhow!("single-rank communicator has no peer {peer}"))
    }

    fn recv(&self, peer: usize) -> Result<Tensor> {
        Err(anyhow!("single-rank communicator has no peer {peer}"))
    }
}

/// Ranks living in one process, one thread each, connected by channels.
#[derive(Debug)]
pub struct ThreadComm {
    info: TpInfo,
    senders: Vec<Option<Sender<Tensor>>>,
    receivers: Vec<Option<Mutex<Receiver<Tensor>>>>,
}

impl ThreadComm {
    /// One communicator per rank of a `world_size` group.
    pub fn group(world_size: usize) -> Result<Vec<Arc<dyn Communicator>>> {
        ensure!(world_size > 0, "world_size must be positive");
        let mut senders: Vec<Vec<Option<Sender<Tensor>>>> =
            (0..world_size).map(|_| (0..world_size).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Mutex<Receiver<Tensor>>>>> =
            (0..world_size).map(|_| (0..world_size).map(|_| None).collect()).collect();
        for from in 0..world_size {
            for to in 0..world_size {
                if from == to {
                    continue;
                }
                let (tx, rx) = channel();
                senders[from][to] = Some(tx);
                receivers[to][from] = Some(Mutex::new(rx));
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| {
                Ok(Arc::new(Self {
                    info: TpInfo::new(rank, world_size)?,
                    senders,
                    receivers,
                }) as Arc<dyn Communicator>)
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn info(&self) -> TpInfo {
        self.info
    }

    fn send(&self, tensor: &Tensor, peer: usize) -> Result<()> {
        let sender = self
            .senders
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("rank {} has no channel to {peer}", self.info.rank))?;
        sender
            .send(tensor.clone())
            .map_err(|_| anyhow!("rank {peer} hung up"))
    }

    fn recv(&self, peer: usize) -> Result<Tensor> {
        let receiver = self
            .receivers
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("rank {} has no channel from {peer}", self.info.rank))?;
        receiver
            .lock()
            .recv()
            .map_err(|_| anyhow!("rank {peer} hung up"))
    }
}

pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Result<Range<usize>> {
    ensure!(world_size > 0, "world_size must be positive");
    ensure!(rank < world_size, "rank must be < world_size");
    ensure!(
        total.is_multiple_of(world_size),
        "dimension {} must be divisible by world_size {}",
        total,
        world_size
    );
    let size = total / world_size;
    let start = rank * size;
    let end = start + size;
    Ok(start..end)
}

/// KV heads held by `rank`: a contiguous slice when the heads split evenly,
/// otherwise the single head this rank replicates.
pub fn kv_head_range(total_num_kv_heads: usize, rank: usize, world_size: usize) -> Result<Range<usize>> {
    ensure!(total_num_kv_heads > 0, "num_kv_heads must be positive");
    ensure!(world_size > 0, "world_size must be positive");
    ensure!(rank < world_size, "rank must be < world_size");
    if total_num_kv_heads >= world_size {
        shard_range(total_num_kv_heads, rank, world_size)
    } else {
        ensure!(
            world_size.is_multiple_of(total_num_kv_heads),
            "world_size must be divisible by num_kv_heads when replicated"
        );
        let ranks_per_kv_head = world_size / total_num_kv_heads;
        let head = rank / ranks_per_kv_head;
        Ok(head..head + 1)
    }
}
