use chrono::Duration;
use domains::{CollectionName, ModeratorActionType, VoteError, VoteType};
use integration_tests::Harness;
use prometheus_client::registry::Registry;
use services::metrics::OutcomeLabels;
use services::rate_limit::{Consequence, Threshold, UserScope, VoteClass};
use services::{VoteMetrics, VoteRateLimitRule, VoteRequest, VotingConfig};

fn daily_cap(threshold: usize) -> VoteRateLimitRule {
    VoteRateLimitRule {
        threshold: Threshold::Fixed(threshold),
        window_minutes: Some(24 * 60),
        class: VoteClass::All,
        scope: UserScope::AllUsers,
        consequences: vec![Consequence::DenyThisVote],
        message: "daily cap".to_string(),
    }
}

#[tokio::test]
async fn test_threshold_vote_is_denied() {
    let h = Harness::builder().rules(vec![daily_cap(30)]).build();
    let voter = h.user(0).await;

    for _ in 0..29 {
        let author = h.user(0).await;
        let post = h.post(author.id).await;
        h.clock.advance(Duration::minutes(1));
        h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
    }

    let author = h.user(0).await;
    let post = h.post(author.id).await;
    let err = h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap_err();
    assert!(matches!(err, VoteError::RateLimitExceeded(ref message) if message == "daily cap"));
    assert!(h.live_votes(&post, &voter).await.is_empty());
    assert_eq!(h.karma(&author).await, 0);
}

#[tokio::test]
async fn test_votes_outside_the_window_do_not_count() {
    let h = Harness::builder().rules(vec![daily_cap(3)]).build();
    let voter = h.user(0).await;
    let author = h.user(0).await;

    for _ in 0..2 {
        let post = h.post(author.id).await;
        h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
    }
    h.clock.advance(Duration::hours(25));

    let post = h.post(author.id).await;
    h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
}

#[tokio::test]
async fn test_per_minute_burst_is_denied_then_recovers() {
    let h = Harness::new();
    let voter = h.user(0).await;
    let author = h.user(0).await;

    for _ in 0..9 {
        let post = h.post(author.id).await;
        h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
    }
    let post = h.post(author.id).await;
    let err = h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap_err();
    assert!(matches!(err, VoteError::RateLimitExceeded(ref message) if message == "too many votes in one minute"));

    h.clock.advance(Duration::minutes(2));
    h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
}

#[tokio::test]
async fn test_strong_votes_have_a_tighter_budget() {
    let h = Harness::new();
    let voter = h.user(100).await;

    for _ in 0..4 {
        let author = h.user(0).await;
        let post = h.post(author.id).await;
        h.vote(&voter, &post, VoteType::BigUpvote).await.unwrap();
    }
    let author = h.user(0).await;
    let post = h.post(author.id).await;
    let err = h.vote(&voter, &post, VoteType::BigUpvote).await.unwrap_err();
    assert!(matches!(err, VoteError::RateLimitExceeded(ref message) if message == "too many strong-votes in one minute"));

    // small votes still fit under the general per-minute rule
    h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
}

#[tokio::test]
async fn test_targeted_downvoting_warns_once_then_flags() {
    let h = Harness::new();
    let voter = h.user(0).await;
    let target = h.user(0).await;

    let mut warnings = Vec::new();
    for _ in 0..10 {
        let post = h.post(target.id).await;
        h.clock.advance(Duration::seconds(61));
        let outcome = h.vote(&voter, &post, VoteType::SmallDownvote).await.unwrap();
        warnings.push(outcome.show_voting_pattern_warning);
    }

    assert_eq!(warnings.iter().filter(|w| **w).count(), 1);
    assert!(warnings[6]);
    let delivered: Vec<_> = h
        .store
        .moderator_actions(voter.id)
        .into_iter()
        .filter(|r| r.action_type == ModeratorActionType::VotingPatternWarningDelivered)
        .collect();
    assert_eq!(delivered.len(), 1);
    assert!(h.wait_for_action(&voter, ModeratorActionType::PotentialTargetedDownvoting).await);
}

#[tokio::test]
async fn test_warning_is_delivered_again_after_cooldown() {
    let h = Harness::new();
    let voter = h.user(0).await;
    let target = h.user(0).await;

    for _ in 0..7 {
        let post = h.post(target.id).await;
        h.clock.advance(Duration::seconds(61));
        h.vote(&voter, &post, VoteType::SmallDownvote).await.unwrap();
    }
    h.clock.advance(Duration::minutes(61));

    let post = h.post(target.id).await;
    let outcome = h.vote(&voter, &post, VoteType::SmallDownvote).await.unwrap();
    assert!(outcome.show_voting_pattern_warning);
}

#[tokio::test]
async fn test_warning_survives_a_failed_cast() {
    let warn_on_downvotes = VoteRateLimitRule {
        threshold: Threshold::Fixed(1),
        window_minutes: Some(60),
        class: VoteClass::OnlyDown,
        scope: UserScope::AllUsers,
        consequences: vec![Consequence::WarningPopup],
        message: "slow down".to_string(),
    };
    let h = Harness::builder().rules(vec![warn_on_downvotes]).build();
    let voter = h.user(0).await;
    let author = h.user(0).await;
    let post = h.post(author.id).await;
    let comment = h.comment(author.id, post.id).await;

    h.hooks.fail_automod(true);
    assert!(h.vote(&voter, &comment, VoteType::SmallDownvote).await.is_err());
    assert!(h.store.moderator_actions(voter.id).is_empty());

    h.hooks.fail_automod(false);
    let outcome = h.vote(&voter, &comment, VoteType::SmallDownvote).await.unwrap();
    assert!(outcome.show_voting_pattern_warning);
    let delivered = h
        .store
        .moderator_actions(voter.id)
        .into_iter()
        .filter(|r| r.action_type == ModeratorActionType::VotingPatternWarningDelivered)
        .count();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn test_downvotes_on_one_authors_comments_within_a_post() {
    let h = Harness::new();
    let voter = h.user(0).await;
    let commenter = h.user(0).await;
    let bystander = h.user(0).await;
    let post = h.post(bystander.id).await;

    for _ in 0..2 {
        let comment = h.comment(commenter.id, post.id).await;
        h.vote(&voter, &comment, VoteType::SmallDownvote).await.unwrap();
    }

    // another author's comment on the same post is unaffected
    let other = h.comment(bystander.id, post.id).await;
    h.vote(&voter, &other, VoteType::SmallDownvote).await.unwrap();

    let comment = h.comment(commenter.id, post.id).await;
    let err = h.vote(&voter, &comment, VoteType::SmallDownvote).await.unwrap_err();
    assert!(matches!(
        err,
        VoteError::RateLimitExceeded(ref message)
            if message == "too many downvotes on one user's comments on this post"
    ));

    // the post-scoped rule never applies to the post itself
    h.clock.advance(Duration::minutes(2));
    let commenters_post = h.post(commenter.id).await;
    h.vote(&voter, &commenters_post, VoteType::SmallDownvote).await.unwrap();
}

#[tokio::test]
async fn test_exempt_votes_skip_rate_limits() {
    let h = Harness::builder().rules(vec![daily_cap(1)]).build();
    let author = h.user(0).await;
    let admin = h.admin().await;
    let voter = h.user(0).await;

    for _ in 0..3 {
        let post = h.post(author.id).await;
        h.vote(&admin, &post, VoteType::SmallUpvote).await.unwrap();
        h.vote(&author, &post, VoteType::SmallUpvote).await.unwrap();
        h.service
            .perform_vote(
                VoteRequest::new(CollectionName::Posts, post.id, voter.id, VoteType::SmallUpvote).skip_rate_limits(),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_rate_limits_can_be_disabled() {
    let config = VotingConfig {
        rate_limits_enabled: false,
        ..VotingConfig::default()
    };
    let h = Harness::builder().config(config).rules(vec![daily_cap(1)]).build();
    let voter = h.user(0).await;
    let author = h.user(0).await;

    for _ in 0..3 {
        let post = h.post(author.id).await;
        h.vote(&voter, &post, VoteType::SmallUpvote).await.unwrap();
    }
}

#[tokio::test]
async fn test_denials_are_counted() {
    let mut registry = Registry::default();
    let metrics = VoteMetrics::register(&mut registry);
    let h = Harness::builder().rules(vec![daily_cap(2)]).build();
    let h = Harness {
        service: h.service.with_metrics(metrics.clone()),
        ..h
    };
    let voter = h.user(0).await;
    let author = h.user(0).await;

    let first = h.post(author.id).await;
    let second = h.post(author.id).await;
    h.vote(&voter, &first, VoteType::SmallUpvote).await.unwrap();
    assert!(h.vote(&voter, &second, VoteType::SmallUpvote).await.is_err());

    let denied = metrics
        .rate_limit
        .get_or_create(&OutcomeLabels {
            outcome: "deny".to_string(),
        })
        .get();
    assert_eq!(denied, 1);
}
