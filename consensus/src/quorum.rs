//! Quorum threshold arithmetic

/// A vote finalizes once its confirmed entries reach the threshold fixed
/// at creation.
pub fn has_quorum(confirmed: u32, required: u32) -> bool {
    confirmed >= required
}

/// Rounds left before the retry budget is spent.
pub fn rounds_remaining(opened: u32, max_rounds: u32) -> u32 {
    max_rounds.saturating_sub(opened)
}
