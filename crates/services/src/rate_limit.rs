//! # Vote rate limiting
//!
//! A fixed, ordered table of rules evaluated against the voter's recent
//! history. Each exceeded rule contributes its consequences; the first
//! exceeded rule supplies the message shown to the user.
//!
//! This is a soft defense. History reads are not serialized against the
//! voter's concurrent requests, so a burst may let one extra vote through.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use domains::{
    CollectionName, DocumentKind, DocumentRepo, ModerationLog, ModeratorActionType, Result, User,
    UserId, Vote, VoteError, VoteReader, VoteType, VoteableDocument,
};
use tracing::{debug, error, info, warn};

/// Which vote types a rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteClass {
    All,
    OnlyStrong,
    OnlyDown,
}

impl VoteClass {
    pub fn matches(&self, vote_type: VoteType) -> bool {
        match self {
            VoteClass::All => true,
            VoteClass::OnlyStrong => vote_type.is_strong(),
            VoteClass::OnlyDown => vote_type.is_down(),
        }
    }
}

/// Whose content a rule counts votes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserScope {
    AllUsers,
    /// Only votes on content by the author of the document being voted on.
    SingleUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Consequence {
    DenyThisVote,
    FlagForModeration,
    WarningPopup,
}

#[derive(Debug, Clone, Copy)]
pub enum Threshold {
    Fixed(usize),
    /// Computed from the comment count of the post being voted on (or the
    /// post a comment belongs to).
    PerPostComments(fn(u32) -> usize),
}

impl Threshold {
    pub fn resolve(&self, comment_count: u32) -> usize {
        match self {
            Threshold::Fixed(n) => *n,
            Threshold::PerPostComments(f) => f(comment_count),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoteRateLimitRule {
    pub threshold: Threshold,
    /// `None` counts all-time votes on other comments of the same post
    /// instead of a time window.
    pub window_minutes: Option<i64>,
    pub class: VoteClass,
    pub scope: UserScope,
    pub consequences: Vec<Consequence>,
    pub message: String,
}

impl VoteRateLimitRule {
    fn new(
        threshold: Threshold,
        window_minutes: Option<i64>,
        class: VoteClass,
        scope: UserScope,
        consequences: &[Consequence],
        message: &str,
    ) -> Self {
        Self {
            threshold,
            window_minutes,
            class,
            scope,
            consequences: consequences.to_vec(),
            message: message.to_string(),
        }
    }
}

fn downvotes_per_post(comment_count: u32) -> usize {
    (comment_count as usize).div_ceil(5).max(3)
}

/// The production rule table, in evaluation order.
pub fn default_rules() -> Vec<VoteRateLimitRule> {
    use Consequence::*;
    use Threshold::*;
    use UserScope::*;
    use VoteClass::*;

    vec![
        VoteRateLimitRule::new(Fixed(200), Some(24 * 60), All, AllUsers, &[DenyThisVote], "too many votes today"),
        VoteRateLimitRule::new(Fixed(100), Some(60), All, AllUsers, &[DenyThisVote], "too many votes in one hour"),
        VoteRateLimitRule::new(Fixed(40), Some(5), All, AllUsers, &[DenyThisVote], "too many votes in five minutes"),
        VoteRateLimitRule::new(Fixed(10), Some(1), All, AllUsers, &[DenyThisVote], "too many votes in one minute"),
        VoteRateLimitRule::new(
            Fixed(5),
            Some(1),
            OnlyStrong,
            AllUsers,
            &[DenyThisVote],
            "too many strong-votes in one minute",
        ),
        VoteRateLimitRule::new(
            Fixed(10),
            Some(24 * 60),
            OnlyStrong,
            SingleUser,
            &[DenyThisVote],
            "too many strong-votes on one user today",
        ),
        VoteRateLimitRule::new(
            Fixed(10),
            Some(24 * 60),
            OnlyDown,
            SingleUser,
            &[FlagForModeration],
            "many downvotes on one user today",
        ),
        VoteRateLimitRule::new(
            Fixed(7),
            Some(24 * 60),
            OnlyDown,
            SingleUser,
            &[WarningPopup],
            "downvoting one user a lot",
        ),
        VoteRateLimitRule::new(
            PerPostComments(downvotes_per_post),
            None,
            OnlyDown,
            SingleUser,
            &[DenyThisVote],
            "too many downvotes on one user's comments on this post",
        ),
    ]
}

/// The vote being checked.
#[derive(Debug, Clone, Copy)]
pub struct PendingVote<'a> {
    pub vote_type: VoteType,
    pub document: &'a VoteableDocument,
    pub now: DateTime<Utc>,
}

/// Prior votes the rules count against.
#[derive(Debug, Clone, Default)]
pub struct VoteHistory {
    /// Live, non-self votes within the history window.
    pub recent: Vec<Vote>,
    /// Live votes on other comments of the same post, all time.
    pub post_comment_votes: Vec<Vote>,
    pub comment_count: u32,
}

/// Union of the consequences of every exceeded rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitVerdict {
    pub consequences: BTreeSet<Consequence>,
    /// Message of the first exceeded rule.
    pub message: Option<String>,
}

impl RateLimitVerdict {
    pub fn has(&self, consequence: Consequence) -> bool {
        self.consequences.contains(&consequence)
    }
}

/// Evaluates `rules` in order. The pending vote counts toward every rule whose
/// class it matches; a rule is exceeded once the count reaches its threshold.
pub fn evaluate_rules(rules: &[VoteRateLimitRule], pending: &PendingVote<'_>, history: &VoteHistory) -> RateLimitVerdict {
    let target_author: UserId = pending.document.user_id;
    let is_comment = pending.document.collection() == CollectionName::Comments;
    let mut verdict = RateLimitVerdict::default();

    for rule in rules {
        let candidates: Vec<&Vote> = match rule.window_minutes {
            Some(minutes) => {
                match Duration::try_minutes(minutes).and_then(|window| pending.now.checked_sub_signed(window)) {
                    Some(since) => history.recent.iter().filter(|v| v.voted_at >= since).collect(),
                    None => history.recent.iter().collect(),
                }
            }
            None if is_comment => history.post_comment_votes.iter().collect(),
            None => continue,
        };

        let prior = candidates
            .into_iter()
            .filter(|v| rule.class.matches(v.vote_type))
            .filter(|v| match rule.scope {
                UserScope::AllUsers => true,
                UserScope::SingleUser => v.author_ids.contains(&target_author),
            })
            .count();
        let pending_counts = usize::from(rule.class.matches(pending.vote_type));
        let threshold = rule.threshold.resolve(history.comment_count);

        if prior + pending_counts >= threshold {
            debug!(rule = %rule.message, count = prior + pending_counts, threshold, "vote rate limit exceeded");
            verdict.consequences.extend(rule.consequences.iter().copied());
            if verdict.message.is_none() {
                verdict.message = Some(rule.message.clone());
            }
        }
    }
    verdict
}

/// Outcome of a rate-limit check that let the vote through. Nothing is
/// recorded until [`RateLimiter::record_consequences`] runs after the cast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub verdict: RateLimitVerdict,
    /// The voter has not been warned within the cooldown.
    pub warning_due: bool,
}

pub struct RateLimiter {
    rules: Vec<VoteRateLimitRule>,
    history_window: Duration,
    warning_cooldown: Duration,
    votes: Arc<dyn VoteReader>,
    documents: Arc<dyn DocumentRepo>,
    moderation: Arc<dyn ModerationLog>,
}

impl RateLimiter {
    pub fn new(
        rules: Vec<VoteRateLimitRule>,
        history_window: Duration,
        warning_cooldown: Duration,
        votes: Arc<dyn VoteReader>,
        documents: Arc<dyn DocumentRepo>,
        moderation: Arc<dyn ModerationLog>,
    ) -> Self {
        Self {
            rules,
            history_window,
            warning_cooldown,
            votes,
            documents,
            moderation,
        }
    }

    pub fn rules(&self) -> &[VoteRateLimitRule] {
        &self.rules
    }

    async fn load_history(&self, voter: UserId, pending: &PendingVote<'_>) -> Result<VoteHistory> {
        let recent = self
            .votes
            .recent_votes_by_user(voter, pending.now - self.history_window)
            .await?
            .into_iter()
            .filter(|v| !v.is_self_vote())
            .collect();

        let document = pending.document;
        let (post_comment_votes, comment_count) = match &document.kind {
            DocumentKind::Post(post) => (Vec::new(), post.comment_count),
            DocumentKind::Comment(comment) => match comment.post_id {
                Some(post_id) => {
                    let votes = self
                        .votes
                        .votes_on_post_comments(voter, post_id)
                        .await?
                        .into_iter()
                        .filter(|v| v.document_id != document.id)
                        .collect();
                    let comment_count = self
                        .documents
                        .get_voteable_document(CollectionName::Posts, post_id)
                        .await?
                        .and_then(|post| post.as_post().map(|p| p.comment_count))
                        .unwrap_or(0);
                    (votes, comment_count)
                }
                None => (Vec::new(), 0),
            },
            DocumentKind::Revision(_) | DocumentKind::Tag => (Vec::new(), 0),
        };

        Ok(VoteHistory {
            recent,
            post_comment_votes,
            comment_count,
        })
    }

    /// Checks a non-self vote by a non-admin voter.
    ///
    /// Fails with `RateLimitExceeded` when any exceeded rule denies the vote.
    /// Otherwise reports whether a voting-pattern warning is due. Performs no
    /// writes.
    pub async fn check(&self, voter: &User, pending: PendingVote<'_>) -> Result<RateLimitDecision> {
        let history = self.load_history(voter.id, &pending).await?;
        let verdict = evaluate_rules(&self.rules, &pending, &history);

        if verdict.has(Consequence::DenyThisVote) {
            let message = verdict.message.clone().unwrap_or_default();
            warn!(user_id = %voter.id, %message, "vote denied by rate limit");
            return Err(VoteError::RateLimitExceeded(message));
        }

        let mut warning_due = false;
        if !verdict.has(Consequence::FlagForModeration) && verdict.has(Consequence::WarningPopup) {
            let since = pending.now - self.warning_cooldown;
            warning_due = !self
                .moderation
                .has_recent_action(voter.id, ModeratorActionType::VotingPatternWarningDelivered, since)
                .await?;
        }

        Ok(RateLimitDecision { verdict, warning_due })
    }

    /// Records the consequences of a decision once its vote has been cast:
    /// a moderation flag in the background, or a delivered warning.
    /// Returns whether the voting-pattern warning should be shown.
    pub async fn record_consequences(&self, voter_id: UserId, decision: &RateLimitDecision) -> bool {
        if decision.verdict.has(Consequence::FlagForModeration) {
            let moderation = Arc::clone(&self.moderation);
            warn!(user_id = %voter_id, "flagging potential targeted downvoting");
            tokio::spawn(async move {
                if let Err(err) = moderation
                    .create_moderator_action(voter_id, ModeratorActionType::PotentialTargetedDownvoting)
                    .await
                {
                    error!(user_id = %voter_id, error = %err, "failed to record moderation flag");
                }
            });
            return false;
        }
        if !decision.warning_due {
            return false;
        }

        info!(user_id = %voter_id, "delivering voting pattern warning");
        if let Err(err) = self
            .moderation
            .create_moderator_action(voter_id, ModeratorActionType::VotingPatternWarningDelivered)
            .await
        {
            // the vote is already committed; the warning repeats next time
            error!(user_id = %voter_id, error = %err, "failed to record voting pattern warning");
        }
        true
    }
}
