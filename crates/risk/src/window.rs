use std::collections::VecDeque;

use common::{PnlClass, PnlSample};

/// Classify an unrealised PnL observation (BTC).
///
/// Losses trip at a third of the profit threshold.
pub fn classify(value: f64, threshold: f64) -> PnlClass {
    if value >= threshold {
        PnlClass::Profit
    } else if value <= -threshold / 3.0 {
        PnlClass::Loss
    } else {
        PnlClass::Neutral
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Two consecutive losses.
    StopLoss,
    /// Profit still on the table but shrinking.
    LockGain,
    /// Profit turned into a loss.
    ProtectGain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Window not full yet.
    Observe,
    Hold,
    Close(CloseReason),
}

/// Sliding window of the most recent PnL samples, oldest first.
#[derive(Debug, Clone)]
pub struct PnlWindow {
    samples: VecDeque<PnlSample>,
    capacity: usize,
}

impl PnlWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resize after a settings reload, dropping the oldest samples if shrinking.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn push(&mut self, sample: PnlSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn samples(&self) -> Vec<PnlSample> {
        self.samples.iter().copied().collect()
    }

    /// Compare the oldest sample against the newest once the window is full.
    pub fn decision(&self) -> WindowDecision {
        if !self.is_full() {
            return WindowDecision::Observe;
        }
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return WindowDecision::Observe;
        };
        decide(first, last)
    }
}

fn decide(first: &PnlSample, last: &PnlSample) -> WindowDecision {
    use PnlClass::*;
    match (first.class, last.class) {
        (Loss, Loss) => WindowDecision::Close(CloseReason::StopLoss),
        (Loss, _) => WindowDecision::Hold,
        (Neutral, _) => WindowDecision::Hold,
        (Profit, Profit) if first.value > last.value => WindowDecision::Close(CloseReason::LockGain),
        (Profit, Profit) => WindowDecision::Hold,
        (Profit, Loss) => WindowDecision::Close(CloseReason::ProtectGain),
        (Profit, Neutral) => WindowDecision::Hold,
    }
}
