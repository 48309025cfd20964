//! Score aggregation.
//!
//! Document scores are a materialized view of the live votes: they are always
//! recomputed from the full active set, never patched incrementally.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use domains::{DocumentScores, Vote, VoteType, VoteableDocument};

pub const FRONTPAGE_BONUS: i64 = 10;
pub const CURATED_BONUS: i64 = 10;

const DECAY_EXPONENT: f64 = 0.8;
const AGE_OFFSET_HOURS: f64 = 2.0;

fn round_to_millionths(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Time-decayed ranking score for a document with the given base score.
///
/// Undated documents rank by their raw base score.
pub fn decayed_score(document: &VoteableDocument, base_score: i64, now: DateTime<Utc>) -> f64 {
    let Some(posted_at) = document.posted_at() else {
        return base_score as f64;
    };

    let mut effective = base_score;
    if document.has_frontpage_date() {
        effective += FRONTPAGE_BONUS;
    }
    if document.has_curated_date() {
        effective += CURATED_BONUS;
    }

    let age_hours = ((now - posted_at).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
    round_to_millionths(effective as f64 / (age_hours + AGE_OFFSET_HOURS).powf(DECAY_EXPONENT))
}

/// Recomputes every derived score field of `document` from `votes`.
///
/// Cancelled rows in `votes` are ignored.
pub fn recalculate(document: &VoteableDocument, votes: &[Vote], now: DateTime<Utc>) -> DocumentScores {
    let mut base_score = 0;
    let mut vote_count = 0;
    let mut extended_score: BTreeMap<String, i64> = BTreeMap::new();

    for vote in votes.iter().filter(|v| !v.cancelled) {
        base_score += vote.power;
        // zero-power votes would show up as a count with no score movement
        if vote.vote_type != VoteType::Neutral && vote.power != 0 {
            vote_count += 1;
        }
        if let Some(reactions) = &vote.extended_vote_type {
            for (reaction, set) in reactions {
                if *set {
                    *extended_score.entry(reaction.clone()).or_default() += 1;
                }
            }
        }
    }
    extended_score.retain(|_, count| *count != 0);

    DocumentScores {
        base_score,
        vote_count,
        score: decayed_score(document, base_score, now),
        extended_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domains::{CollectionName, DocumentKind, PostDetails, ScoreMilestones};
    use uuid::Uuid;

    fn post(posted_at: DateTime<Utc>) -> VoteableDocument {
        VoteableDocument {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            coauthor_user_ids: vec![],
            scores: DocumentScores::default(),
            kind: DocumentKind::Post(PostDetails {
                posted_at,
                frontpage_date: None,
                curated_date: None,
                comment_count: 0,
                max_base_score: 0,
                milestones: ScoreMilestones::default(),
                inactive: false,
            }),
        }
    }

    fn vote(vote_type: VoteType, power: i64, cancelled: bool, reactions: &[(&str, bool)]) -> Vote {
        Vote {
            id: Uuid::now_v7(),
            collection_name: CollectionName::Posts,
            document_id: Uuid::nil(),
            user_id: Uuid::now_v7(),
            author_ids: vec![],
            vote_type,
            power,
            extended_vote_type: if reactions.is_empty() {
                None
            } else {
                Some(reactions.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            },
            voted_at: Utc::now(),
            cancelled,
            is_unvote: false,
        }
    }

    #[test]
    fn test_fresh_post_single_upvote() {
        let now = Utc::now();
        let doc = post(now);
        let scores = recalculate(&doc, &[vote(VoteType::SmallUpvote, 1, false, &[])], now);
        assert_eq!(scores.base_score, 1);
        assert_eq!(scores.vote_count, 1);
        assert_eq!(scores.score, 0.574349);
    }

    #[test]
    fn test_cancelled_and_zero_power_votes() {
        let now = Utc::now();
        let doc = post(now);
        let votes = [
            vote(VoteType::BigUpvote, 5, false, &[]),
            vote(VoteType::SmallUpvote, 1, true, &[]),
            vote(VoteType::Neutral, 0, false, &[]),
            vote(VoteType::SmallDownvote, 0, false, &[]),
            vote(VoteType::SmallDownvote, -2, false, &[]),
        ];
        let scores = recalculate(&doc, &votes, now);
        assert_eq!(scores.base_score, 3);
        assert_eq!(scores.vote_count, 2);
    }

    #[test]
    fn test_extended_score_prunes_zero_entries() {
        let now = Utc::now();
        let doc = post(now);
        let votes = [
            vote(VoteType::Neutral, 0, false, &[("insightful", true), ("funny", false)]),
            vote(VoteType::SmallUpvote, 1, false, &[("insightful", true)]),
            vote(VoteType::SmallUpvote, 1, true, &[("confusing", true)]),
        ];
        let scores = recalculate(&doc, &votes, now);
        assert_eq!(scores.extended_score.get("insightful"), Some(&2));
        assert!(!scores.extended_score.contains_key("funny"));
        assert!(!scores.extended_score.contains_key("confusing"));
    }

    #[test]
    fn test_frontpage_and_curated_bonuses() {
        let now = Utc::now();
        let mut doc = post(now);
        if let DocumentKind::Post(p) = &mut doc.kind {
            p.frontpage_date = Some(now);
        }
        assert_eq!(decayed_score(&doc, 1, now), 6.317841);
        if let DocumentKind::Post(p) = &mut doc.kind {
            p.curated_date = Some(now);
        }
        assert_eq!(decayed_score(&doc, 1, now), 12.061333);
    }

    #[test]
    fn test_score_decays_with_age() {
        let now = Utc::now();
        let fresh = decayed_score(&post(now), 10, now);
        let day_old = decayed_score(&post(now - Duration::hours(24)), 10, now);
        assert!(day_old < fresh);
        assert!(day_old > 0.0);
    }

    #[test]
    fn test_undated_documents_use_base_score() {
        let mut doc = post(Utc::now());
        doc.kind = DocumentKind::Tag;
        assert_eq!(decayed_score(&doc, -7, Utc::now()), -7.0);
    }
}
