//! # VotingService
//!
//! The public entry point of the engine. `perform_vote` checks the request,
//! decides between toggling and casting, runs the rate limiter, and applies
//! the cast with all of its side effects inside one store transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use domains::{
    Authorizer, Clock, CollectionName, DocumentId, DocumentKind, DocumentRepo, DocumentScores,
    ExtendedVoteType, KarmaNotifier, ModerationLog, Result, User, UserId, UserRepo, Vote,
    VoteError, VoteHooks, VoteOutcome, VoteReader, VoteStore, VoteType, VoteableDocument,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::VotingConfig;
use crate::karma::KarmaPropagator;
use crate::ledger::{NewVote, VoteLedger};
use crate::metrics::{RateLimitOutcome, VoteMetrics};
use crate::power::vote_power;
use crate::rate_limit::{default_rules, Consequence, PendingVote, RateLimiter, VoteRateLimitRule};

/// Collaborators the service is built from.
#[derive(Clone)]
pub struct VotingPorts {
    pub documents: Arc<dyn DocumentRepo>,
    pub users: Arc<dyn UserRepo>,
    pub votes: Arc<dyn VoteReader>,
    pub store: Arc<dyn VoteStore>,
    pub moderation: Arc<dyn ModerationLog>,
    pub authorizer: Arc<dyn Authorizer>,
    pub hooks: Arc<dyn VoteHooks>,
    pub notifier: Arc<dyn KarmaNotifier>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteRequest {
    pub collection: CollectionName,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub vote_type: VoteType,
    pub extended_vote_type: Option<ExtendedVoteType>,
    pub skip_rate_limits: bool,
    /// Re-casting the current vote type cancels it when set; otherwise the
    /// request is a no-op.
    pub toggle_if_already_voted: bool,
}

impl VoteRequest {
    pub fn new(collection: CollectionName, document_id: DocumentId, user_id: UserId, vote_type: VoteType) -> Self {
        Self {
            collection,
            document_id,
            user_id,
            vote_type,
            extended_vote_type: None,
            skip_rate_limits: false,
            toggle_if_already_voted: true,
        }
    }

    pub fn with_reactions(mut self, reactions: ExtendedVoteType) -> Self {
        self.extended_vote_type = Some(reactions);
        self
    }

    pub fn skip_rate_limits(mut self) -> Self {
        self.skip_rate_limits = true;
        self
    }

    pub fn without_toggle(mut self) -> Self {
        self.toggle_if_already_voted = false;
        self
    }
}

/// Whether `requested` reactions differ from the ones on the current vote.
/// Only reactions set to `true` count; a request without reactions changes nothing.
fn reactions_changed(requested: Option<&ExtendedVoteType>, current: Option<&ExtendedVoteType>) -> bool {
    let Some(requested) = requested else {
        return false;
    };
    fn active(reactions: Option<&ExtendedVoteType>) -> Vec<&str> {
        reactions
            .map(|m| m.iter().filter(|(_, set)| **set).map(|(k, _)| k.as_str()).collect())
            .unwrap_or_default()
    }
    active(Some(requested)) != active(current)
}

pub struct VotingService {
    documents: Arc<dyn DocumentRepo>,
    users: Arc<dyn UserRepo>,
    votes: Arc<dyn VoteReader>,
    store: Arc<dyn VoteStore>,
    moderation: Arc<dyn ModerationLog>,
    authorizer: Arc<dyn Authorizer>,
    hooks: Arc<dyn VoteHooks>,
    clock: Arc<dyn Clock>,
    karma: Arc<KarmaPropagator>,
    ledger: VoteLedger,
    rate_limiter: RateLimiter,
    config: VotingConfig,
    metrics: Option<VoteMetrics>,
}

impl VotingService {
    pub fn new(ports: VotingPorts, config: VotingConfig) -> Self {
        let karma = Arc::new(KarmaPropagator::new(ports.notifier));
        let ledger = VoteLedger::new(Arc::clone(&karma), Arc::clone(&ports.clock));
        let rate_limiter = RateLimiter::new(
            default_rules(),
            config.history_window(),
            config.warning_cooldown(),
            Arc::clone(&ports.votes),
            Arc::clone(&ports.documents),
            Arc::clone(&ports.moderation),
        );
        Self {
            documents: ports.documents,
            users: ports.users,
            votes: ports.votes,
            store: ports.store,
            moderation: ports.moderation,
            authorizer: ports.authorizer,
            hooks: ports.hooks,
            clock: ports.clock,
            karma,
            ledger,
            rate_limiter,
            config,
            metrics: None,
        }
    }

    /// Replaces the default rate-limit rule table.
    pub fn with_rate_limit_rules(mut self, rules: Vec<VoteRateLimitRule>) -> Self {
        self.rate_limiter = RateLimiter::new(
            rules,
            self.config.history_window(),
            self.config.warning_cooldown(),
            Arc::clone(&self.votes),
            Arc::clone(&self.documents),
            Arc::clone(&self.moderation),
        );
        self
    }

    pub fn with_metrics(mut self, metrics: VoteMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &VotingConfig {
        &self.config
    }

    async fn load_document(&self, collection: CollectionName, id: DocumentId) -> Result<VoteableDocument> {
        self.documents
            .get_voteable_document(collection, id)
            .await?
            .ok_or(VoteError::DocumentNotFound { collection, id })
    }

    async fn load_user(&self, id: UserId) -> Result<User> {
        self.users.get_user(id).await?.ok_or(VoteError::UserNotFound(id))
    }

    /// Debate replies are only voteable by the post's participants, and
    /// revisions only when they revise a tag.
    async fn check_document_guards(&self, document: &VoteableDocument, user: &User) -> Result<()> {
        let collection = document.collection();
        match &document.kind {
            DocumentKind::Comment(comment) if comment.debate_response => {
                let Some(post_id) = comment.post_id else {
                    return Err(VoteError::invalid_operation(collection, "debate response has no post"));
                };
                let post = self.load_document(CollectionName::Posts, post_id).await?;
                if !post.author_ids().contains(&user.id) {
                    return Err(VoteError::invalid_operation(
                        collection,
                        "only the post's coauthors can vote on debate responses",
                    ));
                }
                Ok(())
            }
            DocumentKind::Revision(revision) if revision.collection_name != CollectionName::Tags => Err(
                VoteError::invalid_operation(collection, "only tag revisions can be voted on"),
            ),
            _ => Ok(()),
        }
    }

    fn spawn_search_resync(&self, collection: CollectionName, document_id: DocumentId) {
        if !self.config.is_search_indexed(collection) {
            return;
        }
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            if let Err(err) = hooks.resync_search_index(collection, document_id).await {
                error!(%collection, %document_id, error = %err, "search index resync failed");
            }
        });
    }

    fn record_cancelled(&self, collection: CollectionName, count: usize) {
        if let Some(metrics) = &self.metrics {
            if count > 0 {
                metrics.record_cancelled(collection, count as u64);
            }
        }
    }

    /// Casts, changes or toggles off the requesting user's vote on a document.
    #[instrument(
        skip_all,
        fields(
            collection = %request.collection,
            document_id = %request.document_id,
            user_id = %request.user_id,
            vote_type = %request.vote_type,
        )
    )]
    pub async fn perform_vote(&self, request: VoteRequest) -> Result<VoteOutcome> {
        let collection = request.collection;
        let user = self.load_user(request.user_id).await?;
        if user.banned {
            return Err(VoteError::PermissionDenied {
                collection,
                action: "vote".to_string(),
            });
        }

        let document = self.load_document(collection, request.document_id).await?;
        let existing = self.votes.canonical_vote(collection, document.id, user.id).await?;
        let reactions_differ = reactions_changed(
            request.extended_vote_type.as_ref(),
            existing.as_ref().and_then(|v| v.extended_vote_type.as_ref()),
        );
        let same_type = existing.as_ref().is_some_and(|v| v.vote_type == request.vote_type);
        let pure_reaction_change = reactions_differ && (same_type || request.vote_type == VoteType::Neutral);

        if request.vote_type != VoteType::Neutral && !pure_reaction_change {
            let action = request.vote_type.permission_action(collection)?;
            if !self.authorizer.user_can_do(&user, &action) {
                warn!(%action, "vote permission denied");
                return Err(VoteError::PermissionDenied { collection, action });
            }
        }

        let power = vote_power(user.karma, request.vote_type);
        let author_ids: Vec<UserId> = self
            .users
            .fetch_document_authors(&document)
            .await?
            .into_iter()
            .map(|author| author.id)
            .collect();
        let is_self_vote = author_ids.contains(&user.id);

        self.check_document_guards(&document, &user).await?;

        if same_type && !reactions_differ {
            return self.toggle(&request, &document).await;
        }

        let mut decision = None;
        let rate_limited = !request.skip_rate_limits && self.config.rate_limits_enabled && !is_self_vote && !user.is_admin;
        if rate_limited {
            let pending = PendingVote {
                vote_type: request.vote_type,
                document: &document,
                now: self.clock.now(),
            };
            match self.rate_limiter.check(&user, pending).await {
                Ok(checked) => decision = Some(checked),
                Err(err) => {
                    if let (Some(metrics), VoteError::RateLimitExceeded(_)) = (&self.metrics, &err) {
                        metrics.record_rate_limit(RateLimitOutcome::Deny);
                    }
                    return Err(err);
                }
            }
        }

        let new_vote = NewVote {
            collection,
            document_id: document.id,
            user_id: user.id,
            vote_type: request.vote_type,
            power,
            extended_vote_type: request.extended_vote_type.clone(),
            author_ids,
        };
        let document = self.cast_in_transaction(new_vote).await?;

        // consequences only count for votes that were actually cast
        let mut show_voting_pattern_warning = false;
        if let Some(decision) = &decision {
            if let Some(metrics) = &self.metrics {
                if decision.verdict.has(Consequence::FlagForModeration) {
                    metrics.record_rate_limit(RateLimitOutcome::Flag);
                } else if decision.verdict.has(Consequence::WarningPopup) {
                    metrics.record_rate_limit(RateLimitOutcome::Warn);
                }
            }
            show_voting_pattern_warning = self.rate_limiter.record_consequences(user.id, decision).await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_cast(collection, request.vote_type);
        }
        self.spawn_search_resync(collection, document.id);

        Ok(VoteOutcome {
            base_score: document.scores.base_score,
            vote_count: document.scores.vote_count,
            vote_type: request.vote_type,
            show_voting_pattern_warning,
        })
    }

    async fn toggle(&self, request: &VoteRequest, document: &VoteableDocument) -> Result<VoteOutcome> {
        if !request.toggle_if_already_voted {
            debug!("vote unchanged");
            return Ok(VoteOutcome {
                base_score: document.scores.base_score,
                vote_count: document.scores.vote_count,
                vote_type: request.vote_type,
                show_voting_pattern_warning: false,
            });
        }

        let mut tx = self.store.begin().await?;
        let live = tx.live_votes(request.collection, document.id, request.user_id).await?;
        let cancelled = self.ledger.cancel_votes(tx.as_mut(), live).await?;
        let document = self.ledger.recompute(tx.as_mut(), request.collection, document.id).await?;
        self.karma.bump_max_score(tx.as_mut(), &document, self.clock.now()).await?;
        tx.commit().await?;

        info!(base_score = document.scores.base_score, "vote toggled off");
        self.karma.notify(&cancelled.crossings).await;
        self.record_cancelled(request.collection, cancelled.votes.len());
        self.spawn_search_resync(request.collection, document.id);

        Ok(VoteOutcome {
            base_score: document.scores.base_score,
            vote_count: document.scores.vote_count,
            vote_type: VoteType::Neutral,
            show_voting_pattern_warning: false,
        })
    }

    /// Inserts the vote, cancels every older live vote by the same user on
    /// the document, then applies karma, milestones and the comment automod
    /// hook. Nothing is visible until the transaction commits, and karma
    /// threshold notifications are only sent after it has.
    async fn cast_in_transaction(&self, new_vote: NewVote) -> Result<VoteableDocument> {
        let collection = new_vote.collection;
        let (document_id, user_id) = (new_vote.document_id, new_vote.user_id);

        let mut tx = self.store.begin().await?;
        let (vote, _) = self.ledger.cast(tx.as_mut(), new_vote).await?;
        let (document, cleaned_up) = self.ledger.cancel(tx.as_mut(), collection, document_id, user_id, true).await?;

        let now = self.clock.now();
        let side_effects = async {
            let crossings = self.karma.apply_vote(tx.as_mut(), &vote).await?;
            self.karma.bump_max_score(tx.as_mut(), &document, now).await?;
            Ok::<_, VoteError>(crossings)
        };
        let automod = async {
            if collection == CollectionName::Comments {
                self.hooks.comment_automod(&document, &vote).await?;
            }
            Ok::<_, VoteError>(())
        };
        let (side_effects, automod) = tokio::join!(side_effects, automod);
        let crossings = side_effects?;
        automod?;

        tx.commit().await?;
        info!(vote_id = %vote.id, power = vote.power, base_score = document.scores.base_score, "vote cast");
        self.karma.notify(&cleaned_up.crossings).await;
        self.karma.notify(&crossings).await;
        Ok(document)
    }

    /// Current materialized scores of a document.
    pub async fn document_scores(&self, collection: CollectionName, id: DocumentId) -> Result<DocumentScores> {
        Ok(self.load_document(collection, id).await?.scores)
    }

    /// Cancels every live vote on a document, reversing each one's karma.
    /// Returns how many votes this call cancelled.
    #[instrument(skip(self))]
    pub async fn clear_votes(&self, collection: CollectionName, document_id: DocumentId) -> Result<usize> {
        let live = self.votes.live_votes_on_document(collection, document_id).await?;

        let mut tx = self.store.begin().await?;
        let cancelled = self.ledger.cancel_votes(tx.as_mut(), live).await?;
        self.ledger.recompute(tx.as_mut(), collection, document_id).await?;
        tx.commit().await?;

        info!(count = cancelled.votes.len(), "cleared document votes");
        self.karma.notify(&cancelled.crossings).await;
        self.record_cancelled(collection, cancelled.votes.len());
        self.spawn_search_resync(collection, document_id);
        Ok(cancelled.votes.len())
    }

    /// Cancels every live vote cast by a user, one transaction per document.
    /// Votes on documents that no longer exist are cancelled without a rescore.
    #[instrument(skip(self))]
    pub async fn nullify_user_votes(&self, user_id: UserId) -> Result<usize> {
        let mut by_document: BTreeMap<(CollectionName, DocumentId), Vec<Vote>> = BTreeMap::new();
        for vote in self.votes.live_votes_by_user(user_id).await? {
            by_document
                .entry((vote.collection_name, vote.document_id))
                .or_default()
                .push(vote);
        }

        let mut total = 0;
        for ((collection, document_id), votes) in by_document {
            let mut tx = self.store.begin().await?;
            let cancelled = self.ledger.cancel_votes(tx.as_mut(), votes).await?;
            let document_exists = match self.ledger.recompute(tx.as_mut(), collection, document_id).await {
                Ok(_) => true,
                Err(VoteError::DocumentNotFound { .. }) => {
                    warn!(%collection, %document_id, "nullified votes on a missing document");
                    false
                }
                Err(err) => return Err(err),
            };
            tx.commit().await?;

            self.karma.notify(&cancelled.crossings).await;
            self.record_cancelled(collection, cancelled.votes.len());
            if document_exists {
                self.spawn_search_resync(collection, document_id);
            }
            total += cancelled.votes.len();
        }

        info!(count = total, "nullified user votes");
        Ok(total)
    }
}
