//! # VoteLedger
//!
//! Owns the append-only vote table and the rule that a (document, user) pair
//! has at most one live vote. Casting inserts; cancelling flips `cancelled`
//! with a compare-and-swap and writes a compensating unvote. Every mutation
//! ends by recomputing the document's scores inside the same transaction.

use std::sync::Arc;

use domains::{
    Clock, CollectionName, DocumentId, ExtendedVoteType, KarmaChange, Result, UserId, Vote, VoteError,
    VoteTransaction, VoteType, VoteableDocument,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::karma::KarmaPropagator;
use crate::scoring;

/// A vote about to be written.
#[derive(Debug, Clone)]
pub struct NewVote {
    pub collection: CollectionName,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub vote_type: VoteType,
    pub power: i64,
    pub extended_vote_type: Option<ExtendedVoteType>,
    /// Author snapshot stored on the vote for later self-vote checks.
    pub author_ids: Vec<UserId>,
}

/// Votes a cancellation pass actually flipped, plus the karma threshold
/// crossings to announce once the transaction commits.
#[derive(Debug, Default)]
pub struct CancelledVotes {
    pub votes: Vec<Vote>,
    pub crossings: Vec<KarmaChange>,
}

pub struct VoteLedger {
    karma: Arc<KarmaPropagator>,
    clock: Arc<dyn Clock>,
}

impl VoteLedger {
    pub fn new(karma: Arc<KarmaPropagator>, clock: Arc<dyn Clock>) -> Self {
        Self { karma, clock }
    }

    /// Inserts a live vote and recomputes the document. Does not decide
    /// toggling and does not touch karma.
    pub async fn cast(
        &self,
        tx: &mut dyn VoteTransaction,
        new_vote: NewVote,
    ) -> Result<(Vote, VoteableDocument)> {
        let vote = Vote {
            id: Uuid::now_v7(),
            collection_name: new_vote.collection,
            document_id: new_vote.document_id,
            user_id: new_vote.user_id,
            author_ids: new_vote.author_ids,
            vote_type: new_vote.vote_type,
            power: new_vote.power,
            extended_vote_type: new_vote.extended_vote_type,
            voted_at: self.clock.now(),
            cancelled: false,
            is_unvote: false,
        };
        tx.insert_vote(&vote).await?;
        debug!(vote_id = %vote.id, power = vote.power, "inserted vote");

        let document = self.recompute(tx, vote.collection_name, vote.document_id).await?;
        Ok((vote, document))
    }

    /// Cancels the user's live votes on a document.
    ///
    /// With `exclude_latest` the most recent live vote survives; this is the
    /// cleanup pass for duplicates left behind by racing requests.
    #[instrument(skip(self, tx))]
    pub async fn cancel(
        &self,
        tx: &mut dyn VoteTransaction,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
        exclude_latest: bool,
    ) -> Result<(VoteableDocument, CancelledVotes)> {
        let mut live = tx.live_votes(collection, document_id, user_id).await?;
        if exclude_latest {
            live.pop();
        }
        let cancelled = self.cancel_votes(tx, live).await?;
        let document = self.recompute(tx, collection, document_id).await?;
        Ok((document, cancelled))
    }

    /// Cancels each vote through `try_cancel_vote`. Only votes whose flag this
    /// call actually flipped get an unvote and a karma reversal, so racing
    /// cancellations reverse a vote at most once. Returns the votes this call
    /// cancelled. Scores are left for the caller to recompute.
    pub async fn cancel_votes(&self, tx: &mut dyn VoteTransaction, votes: Vec<Vote>) -> Result<CancelledVotes> {
        let mut cancelled = CancelledVotes::default();
        for vote in votes {
            if !tx.try_cancel_vote(vote.id).await? {
                debug!(vote_id = %vote.id, "vote already cancelled elsewhere");
                continue;
            }
            let unvote = vote.unvote(self.clock.now());
            tx.insert_vote(&unvote).await?;
            cancelled.crossings.extend(self.karma.reverse_vote(tx, &vote).await?);
            info!(vote_id = %vote.id, vote_type = %vote.vote_type, power = vote.power, "cancelled vote");
            cancelled.votes.push(vote);
        }
        Ok(cancelled)
    }

    /// Rewrites the derived score fields from the live votes and returns the
    /// updated document.
    pub async fn recompute(
        &self,
        tx: &mut dyn VoteTransaction,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> Result<VoteableDocument> {
        let mut document = tx
            .load_document(collection, document_id)
            .await?
            .ok_or(VoteError::DocumentNotFound {
                collection,
                id: document_id,
            })?;
        let votes = tx.active_votes_for_document(collection, document_id).await?;
        let scores = scoring::recalculate(&document, &votes, self.clock.now());
        tx.write_document_scores(collection, document_id, &scores).await?;
        document.scores = scores;
        Ok(document)
    }
}
