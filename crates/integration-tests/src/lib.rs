//! Shared fixtures for the end-to-end voting tests.
//!
//! Everything runs over [`MemoryStore`] with a [`FixedClock`], so decay math
//! and rate-limit windows are deterministic.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use domains::{
    Authorizer, Clock, CollectionName, CommentDetails, DocumentId, DocumentKind, DocumentRepo, DocumentScores,
    FixedClock, KarmaNotifier, ModeratorActionType, PostDetails, Result, ScoreMilestones, User,
    UserId, Vote, VoteHooks, VoteOutcome, VoteType, VoteableDocument,
};
use services::{
    LoggingKarmaNotifier, VoteRateLimitRule, VoteRequest, VotingConfig, VotingPorts, VotingService,
};
use storage_adapters::MemoryStore;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Grants every capability except the listed actions.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    denied: BTreeSet<String>,
}

impl StaticAuthorizer {
    pub fn denying(actions: &[&str]) -> Self {
        Self {
            denied: actions.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn user_can_do(&self, _user: &User, action: &str) -> bool {
        !self.denied.contains(action)
    }
}

/// Hooks that remember every call. Automod re-reads the comment from the
/// store the way a real moderation check would.
pub struct RecordingHooks {
    store: MemoryStore,
    fail_automod: AtomicBool,
    automod: Mutex<Vec<(DocumentId, Uuid)>>,
    resynced: Mutex<Vec<(CollectionName, DocumentId)>>,
}

impl RecordingHooks {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            fail_automod: AtomicBool::new(false),
            automod: Mutex::default(),
            resynced: Mutex::default(),
        }
    }

    /// Makes every following automod call fail.
    pub fn fail_automod(&self, fail: bool) {
        self.fail_automod.store(fail, Ordering::SeqCst);
    }

    pub async fn automod_calls(&self) -> Vec<(DocumentId, Uuid)> {
        self.automod.lock().await.clone()
    }

    pub async fn resynced(&self) -> Vec<(CollectionName, DocumentId)> {
        self.resynced.lock().await.clone()
    }
}

#[async_trait]
impl VoteHooks for RecordingHooks {
    async fn comment_automod(&self, comment: &VoteableDocument, vote: &Vote) -> anyhow::Result<()> {
        let stored = self
            .store
            .get_voteable_document(CollectionName::Comments, comment.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("comment {} not found", comment.id))?;
        if self.fail_automod.load(Ordering::SeqCst) {
            anyhow::bail!("automod unavailable");
        }
        self.automod.lock().await.push((stored.id, vote.id));
        Ok(())
    }

    async fn resync_search_index(&self, collection: CollectionName, id: DocumentId) -> anyhow::Result<()> {
        self.resynced.lock().await.push((collection, id));
        Ok(())
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<FixedClock>,
    pub hooks: Arc<RecordingHooks>,
    pub service: VotingService,
}

pub struct HarnessBuilder {
    config: VotingConfig,
    rules: Option<Vec<VoteRateLimitRule>>,
    authorizer: Arc<dyn Authorizer>,
    notifier: Arc<dyn KarmaNotifier>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: VotingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rules(mut self, rules: Vec<VoteRateLimitRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn notifier(mut self, notifier: impl KarmaNotifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = MemoryStore::new(clock.clone());
        let hooks = Arc::new(RecordingHooks::new(store.clone()));
        let shared = Arc::new(store.clone());
        let ports = VotingPorts {
            documents: shared.clone(),
            users: shared.clone(),
            votes: shared.clone(),
            store: shared.clone(),
            moderation: shared,
            authorizer: self.authorizer,
            hooks: hooks.clone(),
            notifier: self.notifier,
            clock: clock.clone(),
        };
        let mut service = VotingService::new(ports, self.config);
        if let Some(rules) = self.rules {
            service = service.with_rate_limit_rules(rules);
        }
        Harness {
            store,
            clock,
            hooks,
            service,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: VotingConfig::default(),
            rules: None,
            authorizer: Arc::new(StaticAuthorizer::default()),
            notifier: Arc::new(LoggingKarmaNotifier),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn user(&self, karma: i64) -> User {
        let user = User::new(Uuid::now_v7(), karma);
        self.store.insert_user(user.clone()).await;
        user
    }

    pub async fn admin(&self) -> User {
        let mut user = User::new(Uuid::now_v7(), 0);
        user.is_admin = true;
        self.store.insert_user(user.clone()).await;
        user
    }

    async fn insert(&self, author: UserId, coauthors: &[UserId], kind: DocumentKind) -> VoteableDocument {
        let document = VoteableDocument {
            id: Uuid::now_v7(),
            user_id: author,
            coauthor_user_ids: coauthors.to_vec(),
            scores: DocumentScores::default(),
            kind,
        };
        self.store.insert_document(document.clone()).await;
        document
    }

    pub fn post_details(&self) -> PostDetails {
        PostDetails {
            posted_at: self.clock.now(),
            frontpage_date: None,
            curated_date: None,
            comment_count: 0,
            max_base_score: 0,
            milestones: ScoreMilestones::default(),
            inactive: false,
        }
    }

    /// A post published at the current clock time.
    pub async fn post(&self, author: UserId) -> VoteableDocument {
        self.insert(author, &[], DocumentKind::Post(self.post_details())).await
    }

    pub async fn coauthored_post(&self, author: UserId, coauthors: &[UserId]) -> VoteableDocument {
        self.insert(author, coauthors, DocumentKind::Post(self.post_details())).await
    }

    pub async fn post_with(&self, author: UserId, details: PostDetails) -> VoteableDocument {
        self.insert(author, &[], DocumentKind::Post(details)).await
    }

    pub async fn comment(&self, author: UserId, post_id: DocumentId) -> VoteableDocument {
        let details = CommentDetails {
            post_id: Some(post_id),
            posted_at: self.clock.now(),
            debate_response: false,
            inactive: false,
        };
        self.insert(author, &[], DocumentKind::Comment(details)).await
    }

    pub async fn tag(&self, author: UserId) -> VoteableDocument {
        self.insert(author, &[], DocumentKind::Tag).await
    }

    pub async fn vote(&self, user: &User, document: &VoteableDocument, vote_type: VoteType) -> Result<VoteOutcome> {
        self.service
            .perform_vote(VoteRequest::new(document.collection(), document.id, user.id, vote_type))
            .await
    }

    pub async fn karma(&self, user: &User) -> i64 {
        self.store.user(user.id).await.map(|u| u.karma).unwrap_or_default()
    }

    pub async fn reload(&self, document: &VoteableDocument) -> Option<VoteableDocument> {
        self.store.document(document.collection(), document.id).await
    }

    pub async fn live_votes(&self, document: &VoteableDocument, user: &User) -> Vec<Vote> {
        self.store
            .vote_history(document.collection(), document.id, user.id)
            .await
            .into_iter()
            .filter(|v| !v.cancelled)
            .collect()
    }

    /// Waits for a background moderation record to land.
    pub async fn wait_for_action(&self, user: &User, action_type: ModeratorActionType) -> bool {
        for _ in 0..50 {
            if self
                .store
                .moderator_actions(user.id)
                .iter()
                .any(|r| r.action_type == action_type)
            {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        false
    }

    /// Waits until the search resync hook has been called `count` times.
    pub async fn wait_for_resyncs(&self, count: usize) -> Vec<(CollectionName, DocumentId)> {
        for _ in 0..50 {
            let calls = self.hooks.resynced().await;
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        self.hooks.resynced().await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
