//! # In-memory store
//!
//! Implements every read port and [`VoteStore`] over a committed state behind
//! an `RwLock`. Reads only ever see committed data. A transaction takes the
//! single writer lock, works on a private copy of the state, and publishes it
//! on commit; dropping it uncommitted discards the copy. Reads never wait on
//! an open transaction, so hooks running inside one may use the read ports.
//!
//! Moderator actions are an out-of-band audit trail and live in a separate
//! `DashMap` that transactions never roll back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use domains::{
    Clock, CollectionName, CounterDirection, DocumentId, DocumentKind, DocumentRepo,
    DocumentScores, KarmaChange, ModerationLog, ModeratorActionRecord, ModeratorActionType,
    ScoreMilestones, SystemClock, User, UserId, UserRepo, Vote, VoteReader, VoteStore,
    VoteTransaction, VoteType, VoteableDocument,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    documents: HashMap<(CollectionName, DocumentId), VoteableDocument>,
    users: HashMap<UserId, User>,
    /// Insertion order doubles as the tie-breaker for equal `voted_at`.
    votes: Vec<Vote>,
}

impl MemoryState {
    fn live_votes(&self, collection: CollectionName, document_id: DocumentId, user_id: UserId) -> Vec<Vote> {
        let mut votes: Vec<Vote> = self
            .votes
            .iter()
            .filter(|v| {
                !v.cancelled
                    && v.collection_name == collection
                    && v.document_id == document_id
                    && v.user_id == user_id
            })
            .cloned()
            .collect();
        // stable sort keeps insertion order among equal timestamps
        votes.sort_by_key(|v| v.voted_at);
        votes
    }

    fn active_votes_for_document(&self, collection: CollectionName, document_id: DocumentId) -> Vec<Vote> {
        self.votes
            .iter()
            .filter(|v| !v.cancelled && v.collection_name == collection && v.document_id == document_id)
            .cloned()
            .collect()
    }

    fn comment_post_id(&self, comment_id: DocumentId) -> Option<DocumentId> {
        self.documents
            .get(&(CollectionName::Comments, comment_id))
            .and_then(|d| d.as_comment())
            .and_then(|c| c.post_id)
    }
}

/// Process-local implementation of the storage ports.
#[derive(Clone)]
pub struct MemoryStore {
    committed: Arc<RwLock<MemoryState>>,
    /// Serializes transactions and out-of-band writes.
    writer: Arc<Mutex<()>>,
    moderator_actions: Arc<DashMap<UserId, Vec<ModeratorActionRecord>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            committed: Arc::new(RwLock::new(MemoryState::default())),
            writer: Arc::new(Mutex::new(())),
            moderator_actions: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Applies `f` to the committed state outside of any transaction.
    async fn write_committed<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let _writer = self.writer.lock().await;
        f(&mut *self.committed.write().await)
    }

    pub async fn insert_user(&self, user: User) {
        self.write_committed(|state| state.users.insert(user.id, user)).await;
    }

    pub async fn insert_document(&self, document: VoteableDocument) {
        let key = (document.collection(), document.id);
        self.write_committed(|state| state.documents.insert(key, document)).await;
    }

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.committed.read().await.users.get(&id).cloned()
    }

    pub async fn document(&self, collection: CollectionName, id: DocumentId) -> Option<VoteableDocument> {
        self.committed.read().await.documents.get(&(collection, id)).cloned()
    }

    /// Every row for the pair, including cancelled votes and unvotes.
    pub async fn vote_history(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Vec<Vote> {
        self.committed
            .read()
            .await
            .votes
            .iter()
            .filter(|v| v.collection_name == collection && v.document_id == document_id && v.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Seeds a historical vote directly, bypassing the engine.
    pub async fn insert_raw_vote(&self, vote: Vote) {
        self.write_committed(|state| state.votes.push(vote)).await;
    }

    pub fn moderator_actions(&self, user_id: UserId) -> Vec<ModeratorActionRecord> {
        self.moderator_actions
            .get(&user_id)
            .map(|records| records.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentRepo for MemoryStore {
    async fn get_voteable_document(
        &self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<Option<VoteableDocument>> {
        Ok(self.document(collection, id).await)
    }

    async fn list_active_dated_documents(
        &self,
        collection: CollectionName,
    ) -> anyhow::Result<Vec<VoteableDocument>> {
        let state = self.committed.read().await;
        Ok(state
            .documents
            .values()
            .filter(|d| d.collection() == collection && d.posted_at().is_some() && !d.is_inactive())
            .cloned()
            .collect())
    }

    async fn update_decayed_score(
        &self,
        collection: CollectionName,
        id: DocumentId,
        score: f64,
        inactive: bool,
    ) -> anyhow::Result<()> {
        self.write_committed(|state| -> anyhow::Result<()> {
            let document = state
                .documents
                .get_mut(&(collection, id))
                .ok_or_else(|| anyhow::anyhow!("{collection} document {id} does not exist"))?;
            document.scores.score = score;
            match &mut document.kind {
                DocumentKind::Post(p) => p.inactive = inactive,
                DocumentKind::Comment(c) => c.inactive = inactive,
                DocumentKind::Revision(_) | DocumentKind::Tag => {}
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
        Ok(self.user(id).await)
    }

    async fn fetch_document_authors(&self, document: &VoteableDocument) -> anyhow::Result<Vec<User>> {
        let state = self.committed.read().await;
        Ok(document
            .author_ids()
            .iter()
            .filter_map(|id| state.users.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl VoteReader for MemoryStore {
    async fn canonical_vote(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> anyhow::Result<Option<Vote>> {
        Ok(self.committed.read().await.live_votes(collection, document_id, user_id).pop())
    }

    async fn recent_votes_by_user(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Vote>> {
        let state = self.committed.read().await;
        Ok(state
            .votes
            .iter()
            .filter(|v| !v.cancelled && v.user_id == user_id && v.voted_at >= since)
            .cloned()
            .collect())
    }

    async fn votes_on_post_comments(
        &self,
        user_id: UserId,
        post_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>> {
        let state = self.committed.read().await;
        Ok(state
            .votes
            .iter()
            .filter(|v| {
                !v.cancelled
                    && v.user_id == user_id
                    && v.collection_name == CollectionName::Comments
                    && state.comment_post_id(v.document_id) == Some(post_id)
            })
            .cloned()
            .collect())
    }

    async fn live_votes_by_user(&self, user_id: UserId) -> anyhow::Result<Vec<Vote>> {
        let state = self.committed.read().await;
        Ok(state
            .votes
            .iter()
            .filter(|v| !v.cancelled && v.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn live_votes_on_document(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>> {
        Ok(self.committed.read().await.active_votes_for_document(collection, document_id))
    }
}

#[async_trait]
impl VoteStore for MemoryStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn VoteTransaction>> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let working = self.committed.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            _writer: writer,
            working,
            committed: Arc::clone(&self.committed),
        }))
    }
}

#[async_trait]
impl ModerationLog for MemoryStore {
    async fn create_moderator_action(
        &self,
        user_id: UserId,
        action_type: ModeratorActionType,
    ) -> anyhow::Result<()> {
        let record = ModeratorActionRecord {
            id: Uuid::now_v7(),
            user_id,
            action_type,
            created_at: self.clock.now(),
        };
        self.moderator_actions.entry(user_id).or_default().push(record);
        Ok(())
    }

    async fn has_recent_action(
        &self,
        user_id: UserId,
        action_type: ModeratorActionType,
        since: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(self.moderator_actions.get(&user_id).is_some_and(|records| {
            records
                .iter()
                .any(|r| r.action_type == action_type && r.created_at >= since)
        }))
    }
}

/// Exclusive writer over a private copy of the store. Dropping it without
/// committing discards every change.
pub struct MemoryTransaction {
    _writer: OwnedMutexGuard<()>,
    working: MemoryState,
    committed: Arc<RwLock<MemoryState>>,
}

#[async_trait]
impl VoteTransaction for MemoryTransaction {
    async fn insert_vote(&mut self, vote: &Vote) -> anyhow::Result<()> {
        if self.working.votes.iter().any(|v| v.id == vote.id) {
            anyhow::bail!("vote {} already exists", vote.id);
        }
        self.working.votes.push(vote.clone());
        Ok(())
    }

    async fn live_votes(
        &mut self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> anyhow::Result<Vec<Vote>> {
        Ok(self.working.live_votes(collection, document_id, user_id))
    }

    async fn active_votes_for_document(
        &mut self,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>> {
        Ok(self.working.active_votes_for_document(collection, document_id))
    }

    async fn try_cancel_vote(&mut self, vote_id: Uuid) -> anyhow::Result<bool> {
        match self.working.votes.iter_mut().find(|v| v.id == vote_id && !v.cancelled) {
            Some(vote) => {
                vote.cancelled = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_document(
        &mut self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<Option<VoteableDocument>> {
        Ok(self.working.documents.get(&(collection, id)).cloned())
    }

    async fn write_document_scores(
        &mut self,
        collection: CollectionName,
        id: DocumentId,
        scores: &DocumentScores,
    ) -> anyhow::Result<()> {
        let document = self
            .working
            .documents
            .get_mut(&(collection, id))
            .ok_or_else(|| anyhow::anyhow!("{collection} document {id} does not exist"))?;
        document.scores = scores.clone();
        Ok(())
    }

    async fn write_post_milestones(
        &mut self,
        post_id: DocumentId,
        max_base_score: i64,
        milestones: &ScoreMilestones,
    ) -> anyhow::Result<()> {
        let document = self
            .working
            .documents
            .get_mut(&(CollectionName::Posts, post_id))
            .ok_or_else(|| anyhow::anyhow!("post {post_id} does not exist"))?;
        if let DocumentKind::Post(post) = &mut document.kind {
            post.max_base_score = max_base_score;
            post.milestones = milestones.clone();
        }
        Ok(())
    }

    async fn adjust_karma(&mut self, user_ids: &[UserId], delta: i64) -> anyhow::Result<Vec<KarmaChange>> {
        let mut changes = Vec::with_capacity(user_ids.len());
        for id in user_ids {
            let Some(user) = self.working.users.get_mut(id) else {
                warn!(user_id = %id, "karma update skipped for unknown user");
                continue;
            };
            let old_karma = user.karma;
            user.karma += delta;
            changes.push(KarmaChange {
                user_id: *id,
                old_karma,
                new_karma: user.karma,
                groups: user.groups.clone(),
            });
        }
        Ok(changes)
    }

    async fn add_user_group(&mut self, user_id: UserId, group: &str) -> anyhow::Result<()> {
        if let Some(user) = self.working.users.get_mut(&user_id) {
            user.groups.insert(group.to_string());
        }
        Ok(())
    }

    async fn adjust_vote_counters(
        &mut self,
        user_ids: &[UserId],
        direction: CounterDirection,
        vote_type: VoteType,
        amount: i64,
    ) -> anyhow::Result<()> {
        for id in user_ids {
            if let Some(user) = self.working.users.get_mut(id) {
                let tally = match direction {
                    CounterDirection::Cast => &mut user.votes_cast,
                    CounterDirection::Received => &mut user.votes_received,
                };
                tally.adjust(vote_type, amount);
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let MemoryTransaction { _writer, working, committed } = *self;
        *committed.write().await = working;
        Ok(())
    }
}
