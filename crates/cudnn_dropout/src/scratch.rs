//! Sizing of the dropout scratch buffer.
//!
//! One device allocation holds both regions the primitive needs:
//!
//! ```text
//! [ RNG states | padding | reserve space ]
//!   ^ bound by the dropout descriptor
//!                          ^ passed to forward and backward
//! ```
//!
//! The runtime reports a lower bound for each region. Some library versions reject a states
//! region of exactly the reported size, so a margin is kept on top of it and grown when the
//! runtime refuses the configuration. Everything here is pure bookkeeping; the helper performs
//! the native calls.

use serde::Deserialize;

pub const DEFAULT_ALIGNMENT: usize = 256;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// How scratch memory is sized beyond what the runtime reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScratchPolicy {
    /// Extra bytes reserved for the RNG states on top of the reported size.
    /// `0` by default.
    pub margin_bytes: usize,
    /// How many times the buffer is regrown when the runtime rejects the reported states size.
    /// `3` by default. `0` disables the retry.
    pub retry_limit: u32,
    /// Alignment in bytes of the reserve region inside the allocation.
    /// `256` by default.
    pub alignment: usize,
}

impl Default for ScratchPolicy {
    fn default() -> Self {
        Self {
            margin_bytes: 0,
            retry_limit: DEFAULT_RETRY_LIMIT,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

/// Sizes reported by the runtime for the current input configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchRequirement {
    pub states: usize,
    pub reserve: usize,
}

/// Placement of both regions inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchLayout {
    /// Bytes handed to the dropout descriptor, starting at offset 0.
    pub states_size: usize,
    pub reserve_offset: usize,
    pub reserve_size: usize,
}

impl ScratchLayout {
    /// Smallest allocation that holds `req` with `margin` extra state bytes.
    pub fn minimal_capacity(req: ScratchRequirement, margin: usize, alignment: usize) -> usize {
        align_up(req.states.saturating_add(margin), alignment).saturating_add(req.reserve)
    }

    /// Places both regions inside `capacity` bytes. All slack goes to the states region, the
    /// reserve region sits at the aligned tail. `None` if the allocation is too small.
    pub fn fit(
        capacity: usize,
        req: ScratchRequirement,
        margin: usize,
        alignment: usize,
    ) -> Option<Self> {
        if Self::minimal_capacity(req, margin, alignment) > capacity {
            return None;
        }

        let reserve_offset = align_down(capacity - req.reserve, alignment);
        Some(Self {
            states_size: reserve_offset,
            reserve_offset,
            reserve_size: capacity - reserve_offset,
        })
    }

    pub fn capacity(&self) -> usize {
        self.reserve_offset + self.reserve_size
    }
}

/// Outcome of planning for a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchDecision {
    /// The current buffer is large enough.
    Reuse(ScratchLayout),
    /// Release the current buffer, if any, and allocate `layout.capacity()` bytes.
    Grow(ScratchLayout),
}

impl ScratchDecision {
    pub fn layout(&self) -> ScratchLayout {
        match *self {
            ScratchDecision::Reuse(layout) | ScratchDecision::Grow(layout) => layout,
        }
    }
}

/// Decides when the scratch buffer must grow. Capacity never shrinks.
#[derive(Debug, Clone)]
pub struct ScratchPlanner {
    policy: ScratchPolicy,
    learned_margin: usize,
}

impl ScratchPlanner {
    pub fn new(policy: ScratchPolicy) -> Self {
        Self {
            policy,
            learned_margin: 0,
        }
    }

    pub fn policy(&self) -> &ScratchPolicy {
        &self.policy
    }

    /// Margin currently applied to the states region. Grows after rejected configurations and
    /// stays grown for the lifetime of the planner.
    pub fn margin(&self) -> usize {
        self.policy.margin_bytes.max(self.learned_margin)
    }

    pub fn plan(&self, capacity: Option<usize>, req: ScratchRequirement) -> ScratchDecision {
        let margin = self.margin();
        let alignment = self.alignment();

        if let Some(layout) = capacity.and_then(|c| ScratchLayout::fit(c, req, margin, alignment)) {
            return ScratchDecision::Reuse(layout);
        }

        let capacity = ScratchLayout::minimal_capacity(req, margin, alignment);
        // minimal_capacity always fits
        let layout = ScratchLayout::fit(capacity, req, margin, alignment).unwrap_or(ScratchLayout {
            states_size: capacity - req.reserve,
            reserve_offset: capacity - req.reserve,
            reserve_size: req.reserve,
        });
        ScratchDecision::Grow(layout)
    }

    /// Grows the margin after the runtime refused the states region of `rejected`, which it had
    /// reported as large enough. The new margin always exceeds the slack `rejected` already had,
    /// so the next plan cannot reuse the same region. Returns the new margin.
    pub fn escalate(&mut self, req: ScratchRequirement, rejected: ScratchLayout) -> usize {
        let slack = rejected.states_size.saturating_sub(req.states);
        let current = self.margin().max(slack);
        self.learned_margin = current
            .saturating_mul(2)
            .max(req.states)
            .max(self.alignment());
        self.learned_margin
    }

    fn alignment(&self) -> usize {
        self.policy.alignment.max(1)
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment).saturating_mul(alignment)
}

fn align_down(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    value / alignment * alignment
}
