//! # Ports
//!
//! Contracts the voting engine consumes. Storage adapters implement the
//! repository ports; the host application supplies authorization and hooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    CollectionName, CounterDirection, DocumentId, DocumentScores, KarmaChange,
    ModeratorActionType, ScoreMilestones, User, UserId, Vote, VoteType, VoteableDocument,
};

/// Read access to voteable documents, plus the score refresh writes that run
/// outside vote transactions.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DocumentRepo: Send + Sync {
    async fn get_voteable_document(
        &self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<Option<VoteableDocument>>;

    /// Dated documents not yet marked inactive.
    async fn list_active_dated_documents(
        &self,
        collection: CollectionName,
    ) -> anyhow::Result<Vec<VoteableDocument>>;

    async fn update_decayed_score(
        &self,
        collection: CollectionName,
        id: DocumentId,
        score: f64,
        inactive: bool,
    ) -> anyhow::Result<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>>;

    /// Primary author and coauthors of a document.
    async fn fetch_document_authors(&self, document: &VoteableDocument) -> anyhow::Result<Vec<User>>;
}

/// Vote history queries. All of them return only non-cancelled votes.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VoteReader: Send + Sync {
    async fn canonical_vote(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> anyhow::Result<Option<Vote>>;

    async fn recent_votes_by_user(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Vote>>;

    /// The user's votes on comments belonging to `post_id`, all time.
    async fn votes_on_post_comments(
        &self,
        user_id: UserId,
        post_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>>;

    async fn live_votes_by_user(&self, user_id: UserId) -> anyhow::Result<Vec<Vote>>;

    async fn live_votes_on_document(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>>;
}

/// Opens write transactions.
#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn VoteTransaction>>;
}

/// One atomic unit of vote mutations. Dropping it without `commit` rolls back.
#[async_trait]
pub trait VoteTransaction: Send {
    async fn insert_vote(&mut self, vote: &Vote) -> anyhow::Result<()>;

    /// Non-cancelled votes for the pair, oldest first.
    async fn live_votes(
        &mut self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> anyhow::Result<Vec<Vote>>;

    async fn active_votes_for_document(
        &mut self,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>>;

    /// Flips `cancelled` from false to true. Returns false when the vote was
    /// already cancelled, in which case nothing changed.
    async fn try_cancel_vote(&mut self, vote_id: Uuid) -> anyhow::Result<bool>;

    async fn load_document(
        &mut self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<Option<VoteableDocument>>;

    async fn write_document_scores(
        &mut self,
        collection: CollectionName,
        id: DocumentId,
        scores: &DocumentScores,
    ) -> anyhow::Result<()>;

    async fn write_post_milestones(
        &mut self,
        post_id: DocumentId,
        max_base_score: i64,
        milestones: &ScoreMilestones,
    ) -> anyhow::Result<()>;

    /// Adds `delta` to each user's karma in one batch.
    async fn adjust_karma(&mut self, user_ids: &[UserId], delta: i64) -> anyhow::Result<Vec<KarmaChange>>;

    async fn add_user_group(&mut self, user_id: UserId, group: &str) -> anyhow::Result<()>;

    async fn adjust_vote_counters(
        &mut self,
        user_ids: &[UserId],
        direction: CounterDirection,
        vote_type: VoteType,
        amount: i64,
    ) -> anyhow::Result<()>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
}

/// Audit trail sink for rate-limit consequences.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ModerationLog: Send + Sync {
    async fn create_moderator_action(
        &self,
        user_id: UserId,
        action_type: ModeratorActionType,
    ) -> anyhow::Result<()>;

    async fn has_recent_action(
        &self,
        user_id: UserId,
        action_type: ModeratorActionType,
        since: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Authorizer: Send + Sync {
    fn user_can_do(&self, user: &User, action: &str) -> bool;
}

/// Notifications fired after successful votes.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VoteHooks: Send + Sync {
    /// Runs inside the vote transaction for votes on comments.
    async fn comment_automod(&self, comment: &VoteableDocument, vote: &Vote) -> anyhow::Result<()>;

    /// Best-effort, after commit.
    async fn resync_search_index(
        &self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait KarmaNotifier: Send + Sync {
    async fn karma_threshold_crossed(
        &self,
        user_id: UserId,
        old_karma: i64,
        new_karma: i64,
    ) -> anyhow::Result<()>;
}
