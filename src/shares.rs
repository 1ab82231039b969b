//src/shares.rs

use std::collections::VecDeque;

use serde::Serialize;

pub mod manager;

/// One credited share, as consumed by the reward allocator.
#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub address: String,
    pub miner_id: String,
    pub difficulty: u64,
    pub timestamp: u64,
    pub job_id: String,
    pub daa_score: u64,
}

/// FIFO of credited shares, drained by DAA-score cut-off.
#[derive(Debug, Default)]
pub struct ShareWindow {
    shares: VecDeque<Contribution>,
}

impl ShareWindow {
    pub fn push(&mut self, c: Contribution) {
        self.shares.push_back(c);
    }

    /// Removes and returns, in insertion order, the longest prefix whose
    /// DAA scores are all at or below the cut-off.
    pub fn drain_up_to(&mut self, daa_score: u64) -> Vec<Contribution> {
        let mut drained = Vec::new();
        while self.shares.front().map_or(false, |c| c.daa_score <= daa_score) {
            drained.push(self.shares.pop_front().expect("front checked"));
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}
