//! # KarmaPropagator
//!
//! Applies and reverses the side effects of a vote on the people involved:
//! author karma, automatic group grants, per-type vote counters, and the
//! max-score milestones of posts. Every operation runs inside the caller's
//! vote transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{
    CollectionName, CounterDirection, KarmaChange, KarmaNotifier, Result, UserId, Vote, VoteTransaction,
    VoteType, VoteableDocument, SCORE_MILESTONES,
};
use tracing::{info, warn};

use crate::power::crosses_small_vote_threshold;

/// Groups granted automatically once a user's karma reaches the threshold.
/// Never revoked automatically.
pub const KARMA_GROUPS: [(&str, i64); 2] = [("canModeratePersonal", 50), ("trustLevel1", 2000)];

pub struct KarmaPropagator {
    notifier: Arc<dyn KarmaNotifier>,
}

impl KarmaPropagator {
    pub fn new(notifier: Arc<dyn KarmaNotifier>) -> Self {
        Self { notifier }
    }

    /// Adds `power` to the karma of every author, unless the vote is a self-vote
    /// or targets a collection that carries no karma.
    ///
    /// Returns the changes that crossed the small-vote threshold. They are
    /// only announced through [`notify`](Self::notify) once the caller's
    /// transaction has committed.
    pub async fn apply_karma(
        &self,
        tx: &mut dyn VoteTransaction,
        collection: CollectionName,
        author_ids: &[UserId],
        voting_user_id: UserId,
        power: i64,
    ) -> Result<Vec<KarmaChange>> {
        if !collection.affects_karma() || author_ids.contains(&voting_user_id) || author_ids.is_empty() {
            return Ok(Vec::new());
        }

        let changes = tx.adjust_karma(author_ids, power).await?;
        let mut crossings = Vec::new();
        for change in changes {
            for (group, threshold) in KARMA_GROUPS {
                if change.new_karma >= threshold && !change.groups.contains(group) {
                    tx.add_user_group(change.user_id, group).await?;
                    info!(user_id = %change.user_id, group, karma = change.new_karma, "granted karma group");
                }
            }
            if crosses_small_vote_threshold(change.old_karma, change.new_karma) {
                crossings.push(change);
            }
        }
        Ok(crossings)
    }

    /// Delivers threshold notifications collected from committed karma changes.
    pub async fn notify(&self, crossings: &[KarmaChange]) {
        for change in crossings {
            // delivery is not allowed to fail the vote
            if let Err(err) = self
                .notifier
                .karma_threshold_crossed(change.user_id, change.old_karma, change.new_karma)
                .await
            {
                warn!(user_id = %change.user_id, error = %err, "karma threshold notification failed");
            }
        }
    }

    /// Moves the caster's "cast" counters and every author's "received"
    /// counters by `amount` (+1 on cast, -1 on reversal).
    pub async fn apply_vote_counts(
        &self,
        tx: &mut dyn VoteTransaction,
        author_ids: &[UserId],
        user_id: UserId,
        vote_type: VoteType,
        amount: i64,
    ) -> Result<()> {
        if vote_type == VoteType::Neutral || author_ids.contains(&user_id) {
            return Ok(());
        }
        tx.adjust_vote_counters(&[user_id], CounterDirection::Cast, vote_type, amount)
            .await?;
        tx.adjust_vote_counters(author_ids, CounterDirection::Received, vote_type, amount)
            .await?;
        Ok(())
    }

    /// Raises a post's `max_base_score` and stamps the first crossing of each
    /// milestone. Returns the milestones crossed for the first time.
    pub async fn bump_max_score(
        &self,
        tx: &mut dyn VoteTransaction,
        document: &VoteableDocument,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let Some(post) = document.as_post() else {
            return Ok(Vec::new());
        };
        let base_score = document.scores.base_score;
        if base_score <= post.max_base_score {
            return Ok(Vec::new());
        }

        let mut milestones = post.milestones.clone();
        let crossed: Vec<i64> = SCORE_MILESTONES
            .into_iter()
            .filter(|threshold| base_score >= *threshold && milestones.mark(*threshold, now))
            .collect();
        tx.write_post_milestones(document.id, base_score, &milestones).await?;

        for threshold in &crossed {
            info!(post_id = %document.id, threshold, "post exceeded score milestone");
        }
        Ok(crossed)
    }

    /// Karma and counter effects of a newly cast vote.
    pub async fn apply_vote(&self, tx: &mut dyn VoteTransaction, vote: &Vote) -> Result<Vec<KarmaChange>> {
        let crossings = self
            .apply_karma(tx, vote.collection_name, &vote.author_ids, vote.user_id, vote.power)
            .await?;
        self.apply_vote_counts(tx, &vote.author_ids, vote.user_id, vote.vote_type, 1)
            .await?;
        Ok(crossings)
    }

    /// Undoes [`apply_vote`](Self::apply_vote) using the author snapshot stored on the vote.
    pub async fn reverse_vote(&self, tx: &mut dyn VoteTransaction, vote: &Vote) -> Result<Vec<KarmaChange>> {
        let crossings = self
            .apply_karma(tx, vote.collection_name, &vote.author_ids, vote.user_id, -vote.power)
            .await?;
        self.apply_vote_counts(tx, &vote.author_ids, vote.user_id, vote.vote_type, -1)
            .await?;
        Ok(crossings)
    }
}

/// Stand-in notifier that only logs threshold crossings.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingKarmaNotifier;

#[async_trait]
impl KarmaNotifier for LoggingKarmaNotifier {
    async fn karma_threshold_crossed(&self, user_id: UserId, old_karma: i64, new_karma: i64) -> anyhow::Result<()> {
        info!(%user_id, old_karma, new_karma, "small vote power changed");
        Ok(())
    }
}
