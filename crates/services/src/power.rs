//! Vote power: how much a single vote moves a document's base score.

use domains::VoteType;

/// Karma at which small votes count double.
pub const SMALL_VOTE_DOUBLING_KARMA: i64 = 1000;

/// `(minimum karma, strong-vote multiplier)`, ascending. Below the first tier
/// a strong vote is worth 1.
const STRONG_VOTE_TIERS: [(i64, i64); 15] = [
    (10, 2),
    (100, 3),
    (250, 4),
    (500, 5),
    (1_000, 6),
    (2_500, 7),
    (5_000, 8),
    (10_000, 9),
    (25_000, 10),
    (50_000, 11),
    (75_000, 12),
    (100_000, 13),
    (175_000, 14),
    (250_000, 15),
    (500_000, 16),
];

fn strong_vote_multiplier(karma: i64) -> i64 {
    STRONG_VOTE_TIERS
        .iter()
        .rev()
        .find(|(threshold, _)| karma >= *threshold)
        .map_or(1, |(_, multiplier)| *multiplier)
}

fn small_vote_multiplier(karma: i64) -> i64 {
    if karma >= SMALL_VOTE_DOUBLING_KARMA {
        2
    } else {
        1
    }
}

/// Signed power of a vote of `vote_type` cast by a user with `karma`.
pub fn vote_power(karma: i64, vote_type: VoteType) -> i64 {
    match vote_type {
        VoteType::Neutral => 0,
        VoteType::SmallUpvote => small_vote_multiplier(karma),
        VoteType::SmallDownvote => -small_vote_multiplier(karma),
        VoteType::BigUpvote => strong_vote_multiplier(karma),
        VoteType::BigDownvote => -strong_vote_multiplier(karma),
    }
}

/// Whether moving from `old` to `new` karma changes small-vote power.
pub fn crosses_small_vote_threshold(old: i64, new: i64) -> bool {
    (old >= SMALL_VOTE_DOUBLING_KARMA) != (new >= SMALL_VOTE_DOUBLING_KARMA)
}
