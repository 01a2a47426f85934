use crate::rate_history::RateHistory;

/// Transfer direction a [`Band`] or clamp/consume call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];
}

/// Relative scheduling priority. Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    #[default]
    Low,
    Normal,
    High,
}

/// Per-direction rate-limit state held by a node: how much is left to spend this
/// tick, the desired rate, and the raw/piece rate histories used to compute it.
#[derive(Debug, Clone, Default)]
pub struct Band {
    pub is_limited: bool,
    pub honor_parent_limits: bool,
    pub desired_bps: u64,
    pub bytes_left: u64,
    pub raw: RateHistory,
    pub piece: RateHistory,
}

impl Band {
    pub fn new() -> Self {
        Self {
            honor_parent_limits: true,
            ..Default::default()
        }
    }
}
