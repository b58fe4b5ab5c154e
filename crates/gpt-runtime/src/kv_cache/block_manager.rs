use std::collections::{HashSet, VecDeque};

use anyhow::{Result, anyhow, ensure};
use candle_core::{Device, Tensor};

use crate::error::RuntimeError;

/// Padding entry of block-pointer tables for positions with no block yet.
pub const UNALLOCATED_BLOCK: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct Block {
    pub id: usize,
    pub ref_count: usize,
}

/// A block copy the cache storage must perform before a row writes into a
/// block it used to share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCopy {
    pub src: u32,
    pub dst: u32,
}

/// Free-list of fixed-size KV blocks plus one block table per cache row.
///
/// A row is one (sequence, beam) pair, `row = seq_idx * beam_width + beam`.
#[derive(Debug)]
pub struct BlockManager {
    blocks: Vec<Block>,
    free_block_ids: VecDeque<usize>,
    used_block_ids: HashSet<usize>,
    tokens_per_block: usize,
    max_blocks_per_seq: usize,
    beam_width: usize,
    tables: Vec<Vec<u32>>,
    pending_copies: Vec<BlockCopy>,
}

impl BlockManager {
    pub fn new(
        num_blocks: usize,
        tokens_per_block: usize,
        max_blocks_per_seq: usize,
        max_batch_size: usize,
        beam_width: usize,
    ) -> Result<Self> {
        ensure!(
            tokens_per_block.is_power_of_two(),
            RuntimeError::configuration("tokens_per_block must be a power of two")
        );
        ensure!(beam_width > 0, RuntimeError::configuration("beam_width must be positive"));
        let mut blocks = Vec::with_capacity(num_blocks);
        let mut free_block_ids = VecDeque::with_capacity(num_blocks);
        for id in 0..num_blocks {
            blocks.push(Block { id, ref_count: 0 });
            free_block_ids.push_back(id);
        }
        Ok(Self {
            blocks,
            free_block_ids,
            used_block_ids: HashSet::new(),
            tokens_per_block,
            max_blocks_per_seq,
            beam_width,
            tables: vec![Vec::new(); max_batch_size * beam_width],
            pending_copies: Vec::new(),
        })
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn num_rows(&self) -> usize {
        self.tables.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_block_ids.len()
    }

    pub fn ref_count(&self, block_id: usize) -> usize {
        self.blocks.get(block_id).map_or(0, |b| b.ref_count)
    }

    pub fn blocks_for(&self, positions: usize) -> usize {
        positions.div_ceil(self.tokens_per_block)
    }

    pub fn block_table(&self, row: usize) -> &[u32] {
        self.tables.get(row).map_or(&[], Vec::as_slice)
    }

    /// Grows the table of `row` until it covers `needed_positions`. A shared
    /// block about to receive position `needed_positions - 1` is split first.
    pub fn reserve(&mut self, row: usize, needed_positions: usize) -> Result<&[u32]> {
        ensure!(row < self.tables.len(), "cache row {row} out of range");
        let needed_blocks = self.blocks_for(needed_positions);
        if needed_blocks > self.max_blocks_per_seq {
            return Err(RuntimeError::ShapeUnsupported {
                name: "kv_cache_block_pointers".to_string(),
                shape: vec![needed_blocks],
                reason: format!("at most {} blocks per sequence", self.max_blocks_per_seq),
            }
            .into());
        }
        while self.tables[row].len() < needed_blocks {
            let block_id = self.allocate_block()?;
            self.tables[row].push(block_id as u32);
        }
        if needed_positions > 0 {
            let slot = (needed_positions - 1) / self.tokens_per_block;
            self.split_if_shared(row, slot)?;
        }
        Ok(&self.tables[row])
    }

    /// Makes beams `1..beam_width` of `seq_idx` reference the blocks beam 0 holds
    /// for its prompt. Full blocks are shared; a partially filled last block is
    /// copied per beam because each beam appends into it.
    pub fn share_beams(&mut self, seq_idx: usize, prompt_len: usize) -> Result<()> {
        let source_row = seq_idx * self.beam_width;
        ensure!(
            self.tables[source_row].len() == self.blocks_for(prompt_len),
            "beam 0 of sequence {seq_idx} must hold exactly the prompt blocks before sharing"
        );
        let full = prompt_len / self.tokens_per_block;
        let has_partial = !prompt_len.is_multiple_of(self.tokens_per_block);
        let source = self.tables[source_row].clone();
        for beam in 1..self.beam_width {
            let row = source_row + beam;
            ensure!(
                self.tables[row].is_empty(),
                "beam row {row} must be released before sharing"
            );
            let mut table = Vec::with_capacity(source.len());
            for &block_id in &source[..full] {
                self.increment_block_ref(block_id as usize);
                table.push(block_id);
            }
            if has_partial {
                let src = source[full];
                let dst = self.allocate_block()? as u32;
                self.pending_copies.push(BlockCopy { src, dst });
                table.push(dst);
            }
            self.tables[row] = table;
        }
        Ok(())
    }

    /// Returns every block referenced only by `row` to the free-list.
    pub fn release(&mut self, row: usize) -> usize {
        let Some(table) = self.tables.get_mut(row) else {
            return 0;
        };
        let table = std::mem::take(table);
        let mut freed = 0;
        for &block_id in table.iter().rev() {
            if self.decrement_block_ref(block_id as usize) {
                freed += 1;
            }
        }
        freed
    }

    pub fn release_sequence(&mut self, seq_idx: usize) -> usize {
        let start = seq_idx * self.beam_width;
        (start..start + self.beam_width)
            .map(|row| self.release(row))
            .sum()
    }

    pub fn release_all(&mut self) {
        for row in 0..self.tables.len() {
            self.release(row);
        }
        self.pending_copies.clear();
    }

    pub fn take_pending_copies(&mut self) -> Vec<BlockCopy> {
        std::mem::take(&mut self.pending_copies)
    }

    /// Block tables of the first `rows` rows, padded with `UNALLOCATED_BLOCK` to
    /// `max_blocks_per_seq`.
    pub fn table_tensor(&self, rows: usize, device: &Device) -> Result<Tensor> {
        let width = self.max_blocks_per_seq.max(1);
        let mut flat = vec![UNALLOCATED_BLOCK; rows * width];
        for (row, table) in self.tables.iter().take(rows).enumerate() {
            flat[row * width..row * width + table.len()].copy_from_slice(table);
        }
        Ok(Tensor::from_vec(flat, (rows, width), device)?)
    }

    /// Checks that every referenced block is live and that ref counts match the
    /// number of tables naming each block.
    pub fn check_consistency(&self) -> Result<()> {
        let mut counts = vec![0usize; self.blocks.len()];
        for table in &self.tables {
            for &block_id in table {
                let id = block_id as usize;
                ensure!(
                    self.used_block_ids.contains(&id),
                    RuntimeError::invariant(format!("block {id} referenced but not allocated"))
                );
                counts[id] += 1;
            }
        }
        for (block, count) in self.blocks.iter().zip(counts) {
            ensure!(
                block.ref_count == count,
                RuntimeError::invariant(format!(
                    "block {} ref_count {} but {} references",
                    block.id, block.ref_count, count
                ))
            );
        }
        Ok(())
    }

    fn split_if_shared(&mut self, row: usize, slot: usize) -> Result<()> {
        let src = self.tables[row][slot];
        if self.blocks[src as usize].ref_count <= 1 {
            return Ok(());
        }
        let dst = self.allocate_block()? as u32;
        self.decrement_block_ref(src as usize);
        self.tables[row][slot] = dst;
        self.pending_copies.push(BlockCopy { src, dst });
        Ok(())
    }

    fn allocate_block(&mut self) -> Result<usize> {
        let block_id = self.free_block_ids.pop_front().ok_or_else(|| {
            anyhow!(RuntimeError::OutOfMemory(format!(
                "kv cache block pool of {} blocks exhausted",
                self.blocks.len()
            )))
        })?;
        let block = &mut self.blocks[block_id];
        ensure!(
            block.ref_count == 0,
            RuntimeError::invariant(format!("free block {block_id} has live references"))
        );
        block.ref_count = 1;
        self.used_block_ids.insert(block_id);
        Ok(block_id)
    }

    fn increment_block_ref(&mut self, block_id: usize) {
        self.blocks[block_id].ref_count += 1;
    }

    fn decrement_block_ref(&mut self, block_id: usize) -> bool {
        let block = &mut self.blocks[block_id];
        block.ref_count = block.ref_count.saturating_sub(1);
        if block.ref_count == 0 {
            self.used_block_ids.remove(&block_id);
            self.free_block_ids.push_back(block_id);
            true
        } else {
            false
        }
    }
}
