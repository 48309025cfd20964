//! # Domain Models
//!
//! Votes, the documents they target, and the users whose karma they move.
//! Identifiers are UUID v7 so that insertion order and id order agree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::VoteError;

pub type UserId = Uuid;
pub type DocumentId = Uuid;

/// Reaction name → whether the voter attached it.
pub type ExtendedVoteType = BTreeMap<String, bool>;

/// Collections whose documents can receive votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionName {
    Posts,
    Comments,
    Revisions,
    Tags,
}

impl CollectionName {
    pub const ALL: [CollectionName; 4] = [
        CollectionName::Posts,
        CollectionName::Comments,
        CollectionName::Revisions,
        CollectionName::Tags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Posts => "Posts",
            CollectionName::Comments => "Comments",
            CollectionName::Revisions => "Revisions",
            CollectionName::Tags => "Tags",
        }
    }

    /// Votes on tags never move their author's karma.
    pub fn affects_karma(&self) -> bool {
        !matches!(self, CollectionName::Tags)
    }

    /// Lowercase prefix used in capability names (`posts.smallUpvote`).
    pub fn action_prefix(&self) -> &'static str {
        match self {
            CollectionName::Posts => "posts",
            CollectionName::Comments => "comments",
            CollectionName::Revisions => "revisions",
            CollectionName::Tags => "tags",
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionName {
    type Err = VoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| VoteError::UnknownCollection(s.to_string()))
    }
}

/// The up/down component of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoteType {
    BigUpvote,
    SmallUpvote,
    Neutral,
    SmallDownvote,
    BigDownvote,
}

impl VoteType {
    pub const ALL: [VoteType; 5] = [
        VoteType::BigUpvote,
        VoteType::SmallUpvote,
        VoteType::Neutral,
        VoteType::SmallDownvote,
        VoteType::BigDownvote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::BigUpvote => "bigUpvote",
            VoteType::SmallUpvote => "smallUpvote",
            VoteType::Neutral => "neutral",
            VoteType::SmallDownvote => "smallDownvote",
            VoteType::BigDownvote => "bigDownvote",
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, VoteType::BigUpvote | VoteType::BigDownvote)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, VoteType::SmallDownvote | VoteType::BigDownvote)
    }

    /// Capability a user needs to cast this vote type on `collection`.
    ///
    /// Neutral votes carry no capability and yield `InvalidVoteTypeAction`.
    pub fn permission_action(&self, collection: CollectionName) -> Result<String, VoteError> {
        match self {
            VoteType::Neutral => Err(VoteError::InvalidVoteTypeAction(*self)),
            _ => Ok(format!("{}.{}", collection.action_prefix(), self.as_str())),
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteType {
    type Err = VoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VoteType::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| VoteError::InvalidVoteType(s.to_string()))
    }
}

/// An append-only vote record. Cancelling flips `cancelled` and writes a
/// paired unvote; rows are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: Uuid,
    pub collection_name: CollectionName,
    pub document_id: DocumentId,
    pub user_id: UserId,
    /// Author and coauthors of the document when the vote was cast.
    pub author_ids: Vec<UserId>,
    pub vote_type: VoteType,
    pub power: i64,
    pub extended_vote_type: Option<ExtendedVoteType>,
    pub voted_at: DateTime<Utc>,
    pub cancelled: bool,
    pub is_unvote: bool,
}

impl Vote {
    /// Self-votes are judged against the author snapshot, not the live document.
    pub fn is_self_vote(&self) -> bool {
        self.author_ids.contains(&self.user_id)
    }

    /// The compensating record written when this vote is cancelled.
    pub fn unvote(&self, at: DateTime<Utc>) -> Vote {
        Vote {
            id: Uuid::now_v7(),
            power: -self.power,
            voted_at: at,
            cancelled: true,
            is_unvote: true,
            ..self.clone()
        }
    }
}

/// Materialized aggregate of the live votes on a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentScores {
    pub base_score: i64,
    pub vote_count: i64,
    pub score: f64,
    /// Reaction name → number of live votes carrying it. Zero entries are absent.
    pub extended_score: BTreeMap<String, i64>,
}

/// Base-score thresholds whose first crossing is timestamped on posts.
pub const SCORE_MILESTONES: [i64; 6] = [2, 30, 45, 75, 125, 200];

/// First time a post reached each of [`SCORE_MILESTONES`]. Entries are never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreMilestones(BTreeMap<i64, DateTime<Utc>>);

impl ScoreMilestones {
    pub fn exceeded_date(&self, threshold: i64) -> Option<DateTime<Utc>> {
        self.0.get(&threshold).copied()
    }

    /// Records the crossing unless it was already recorded. Returns whether it was new.
    pub fn mark(&mut self, threshold: i64, at: DateTime<Utc>) -> bool {
        if self.0.contains_key(&threshold) {
            return false;
        }
        self.0.insert(threshold, at);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, DateTime<Utc>)> + '_ {
        self.0.iter().map(|(t, at)| (*t, *at))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDetails {
    pub posted_at: DateTime<Utc>,
    pub frontpage_date: Option<DateTime<Utc>>,
    pub curated_date: Option<DateTime<Utc>>,
    pub comment_count: u32,
    pub max_base_score: i64,
    pub milestones: ScoreMilestones,
    /// Set once the post is too old to be rescored.
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentDetails {
    pub post_id: Option<DocumentId>,
    pub posted_at: DateTime<Utc>,
    /// Replies in a debate may only be voted on by the debate participants.
    pub debate_response: bool,
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionDetails {
    /// Collection of the document this is a revision of.
    pub collection_name: CollectionName,
    pub document_id: DocumentId,
}

/// Collection-specific part of a voteable document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocumentKind {
    Post(PostDetails),
    Comment(CommentDetails),
    Revision(RevisionDetails),
    Tag,
}

/// A document that votes can target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteableDocument {
    pub id: DocumentId,
    pub user_id: UserId,
    pub coauthor_user_ids: Vec<UserId>,
    pub scores: DocumentScores,
    pub kind: DocumentKind,
}

impl VoteableDocument {
    pub fn collection(&self) -> CollectionName {
        match self.kind {
            DocumentKind::Post(_) => CollectionName::Posts,
            DocumentKind::Comment(_) => CollectionName::Comments,
            DocumentKind::Revision(_) => CollectionName::Revisions,
            DocumentKind::Tag => CollectionName::Tags,
        }
    }

    /// Primary author first, then coauthors, without duplicates.
    pub fn author_ids(&self) -> Vec<UserId> {
        let mut ids = vec![self.user_id];
        for id in &self.coauthor_user_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// Undated documents (tags, revisions) are ranked by raw base score.
    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            DocumentKind::Post(p) => Some(p.posted_at),
            DocumentKind::Comment(c) => Some(c.posted_at),
            DocumentKind::Revision(_) | DocumentKind::Tag => None,
        }
    }

    pub fn has_frontpage_date(&self) -> bool {
        matches!(&self.kind, DocumentKind::Post(p) if p.frontpage_date.is_some())
    }

    pub fn has_curated_date(&self) -> bool {
        matches!(&self.kind, DocumentKind::Post(p) if p.curated_date.is_some())
    }

    pub fn is_inactive(&self) -> bool {
        match &self.kind {
            DocumentKind::Post(p) => p.inactive,
            DocumentKind::Comment(c) => c.inactive,
            DocumentKind::Revision(_) | DocumentKind::Tag => false,
        }
    }

    pub fn as_post(&self) -> Option<&PostDetails> {
        match &self.kind {
            DocumentKind::Post(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_comment(&self) -> Option<&CommentDetails> {
        match &self.kind {
            DocumentKind::Comment(c) => Some(c),
            _ => None,
        }
    }
}

/// Per-vote-type counters kept on users, once for votes cast and once for votes received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoteTally {
    pub total: i64,
    pub small_upvote: i64,
    pub big_upvote: i64,
    pub small_downvote: i64,
    pub big_downvote: i64,
}

impl VoteTally {
    pub fn get(&self, vote_type: VoteType) -> i64 {
        match vote_type {
            VoteType::SmallUpvote => self.small_upvote,
            VoteType::BigUpvote => self.big_upvote,
            VoteType::SmallDownvote => self.small_downvote,
            VoteType::BigDownvote => self.big_downvote,
            VoteType::Neutral => 0,
        }
    }

    /// Neutral votes are not counted.
    pub fn adjust(&mut self, vote_type: VoteType, amount: i64) {
        let slot = match vote_type {
            VoteType::SmallUpvote => &mut self.small_upvote,
            VoteType::BigUpvote => &mut self.big_upvote,
            VoteType::SmallDownvote => &mut self.small_downvote,
            VoteType::BigDownvote => &mut self.big_downvote,
            VoteType::Neutral => return,
        };
        *slot += amount;
        self.total += amount;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub karma: i64,
    pub groups: BTreeSet<String>,
    pub votes_cast: VoteTally,
    pub votes_received: VoteTally,
    pub banned: bool,
    pub is_admin: bool,
}

impl User {
    pub fn new(id: UserId, karma: i64) -> Self {
        Self {
            id,
            karma,
            groups: BTreeSet::new(),
            votes_cast: VoteTally::default(),
            votes_received: VoteTally::default(),
            banned: false,
            is_admin: false,
        }
    }
}

/// Which side of a vote a counter adjustment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterDirection {
    Cast,
    Received,
}

/// Result of a batch karma update for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KarmaChange {
    pub user_id: UserId,
    pub old_karma: i64,
    pub new_karma: i64,
    pub groups: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModeratorActionType {
    VotingPatternWarningDelivered,
    PotentialTargetedDownvoting,
}

impl ModeratorActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeratorActionType::VotingPatternWarningDelivered => "votingPatternWarningDelivered",
            ModeratorActionType::PotentialTargetedDownvoting => "potentialTargetedDownvoting",
        }
    }
}

impl fmt::Display for ModeratorActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of a rate-limit consequence applied to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeratorActionRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub action_type: ModeratorActionType,
    pub created_at: DateTime<Utc>,
}

/// Caller-visible result of a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOutcome {
    pub base_score: i64,
    pub vote_count: i64,
    pub vote_type: VoteType,
    pub show_voting_pattern_warning: bool,
}
