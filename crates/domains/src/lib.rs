//! crates/domains/src/lib.rs
//!
//! Domain models, errors, and port traits for the voting engine.

pub mod clock;
pub mod errors;
pub mod models;
pub mod ports;

// Re-exporting for easier access in other crates
pub use clock::*;
pub use errors::*;
pub use models::*;
pub use ports::*;

#[cfg(test)]
mod tests {
    use super::models::*;
    use super::errors::VoteError;
    use chrono::Utc;
    use uuid::Uuid;

    fn vote(user_id: Uuid, author_ids: Vec<Uuid>) -> Vote {
        Vote {
            id: Uuid::now_v7(),
            collection_name: CollectionName::Posts,
            document_id: Uuid::now_v7(),
            user_id,
            author_ids,
            vote_type: VoteType::SmallUpvote,
            power: 2,
            extended_vote_type: None,
            voted_at: Utc::now(),
            cancelled: false,
            is_unvote: false,
        }
    }

    #[test]
    fn test_vote_type_parses_wire_names() {
        assert_eq!("bigDownvote".parse::<VoteType>().unwrap(), VoteType::BigDownvote);
        assert!(matches!(
            "superUpvote".parse::<VoteType>(),
            Err(VoteError::InvalidVoteType(s)) if s == "superUpvote"
        ));
    }

    #[test]
    fn test_permission_action_names() {
        assert_eq!(
            VoteType::SmallUpvote.permission_action(CollectionName::Comments).unwrap(),
            "comments.smallUpvote"
        );
        assert!(matches!(
            VoteType::Neutral.permission_action(CollectionName::Posts),
            Err(VoteError::InvalidVoteTypeAction(VoteType::Neutral))
        ));
    }

    #[test]
    fn test_collection_round_trips_through_str() {
        for c in CollectionName::ALL {
            assert_eq!(c.as_str().parse::<CollectionName>().unwrap(), c);
        }
        assert!("Users".parse::<CollectionName>().is_err());
        assert!(!CollectionName::Tags.affects_karma());
    }

    #[test]
    fn test_unvote_negates_power_and_is_cancelled() {
        let voter = Uuid::now_v7();
        let v = vote(voter, vec![Uuid::now_v7()]);
        let u = v.unvote(Utc::now());
        assert_eq!(u.power, -2);
        assert!(u.cancelled && u.is_unvote);
        assert_ne!(u.id, v.id);
        assert_eq!(u.document_id, v.document_id);
    }

    #[test]
    fn test_self_vote_uses_author_snapshot() {
        let voter = Uuid::now_v7();
        assert!(vote(voter, vec![Uuid::now_v7(), voter]).is_self_vote());
        assert!(!vote(voter, vec![Uuid::now_v7()]).is_self_vote());
    }

    #[test]
    fn test_milestones_are_write_once() {
        let mut m = ScoreMilestones::default();
        let first = Utc::now();
        assert!(m.mark(30, first));
        assert!(!m.mark(30, first + chrono::Duration::hours(1)));
        assert_eq!(m.exceeded_date(30), Some(first));
        assert_eq!(m.exceeded_date(45), None);
    }

    #[test]
    fn test_tally_ignores_neutral() {
        let mut t = VoteTally::default();
        t.adjust(VoteType::BigUpvote, 1);
        t.adjust(VoteType::Neutral, 1);
        t.adjust(VoteType::SmallDownvote, 1);
        t.adjust(VoteType::SmallDownvote, -1);
        assert_eq!(t.total, 1);
        assert_eq!(t.get(VoteType::BigUpvote), 1);
        assert_eq!(t.get(VoteType::SmallDownvote), 0);
    }

    #[test]
    fn test_author_ids_dedup_coauthors() {
        let author = Uuid::now_v7();
        let co = Uuid::now_v7();
        let doc = VoteableDocument {
            id: Uuid::now_v7(),
            user_id: author,
            coauthor_user_ids: vec![co, author],
            scores: DocumentScores::default(),
            kind: DocumentKind::Tag,
        };
        assert_eq!(doc.author_ids(), vec![author, co]);
        assert_eq!(doc.posted_at(), None);
        assert_eq!(doc.collection(), CollectionName::Tags);
    }

    #[test]
    fn test_outcome_serializes_with_camel_case_fields() {
        let outcome = VoteOutcome {
            base_score: 3,
            vote_count: 2,
            vote_type: VoteType::SmallDownvote,
            show_voting_pattern_warning: true,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "baseScore": 3,
                "voteCount": 2,
                "voteType": "smallDownvote",
                "showVotingPatternWarning": true,
            })
        );
    }

    #[test]
    fn test_vote_tally_decodes_from_empty_or_partial_objects() {
        let empty: VoteTally = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, VoteTally::default());

        let partial: VoteTally = serde_json::from_str(r#"{"total": 2, "big_upvote": 2}"#).unwrap();
        assert_eq!(partial.total, 2);
        assert_eq!(partial.get(VoteType::BigUpvote), 2);
        assert_eq!(partial.get(VoteType::SmallDownvote), 0);
    }
}
