//! # Postgres adapter
//!
//! Maps the relational schema in `migrations/` onto the domain models.
//! Collection-specific document fields live in a JSONB `kind` column; the
//! vote table is append-only and cancellation is a conditional update.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{
    Clock, CollectionName, CounterDirection, DocumentId, DocumentKind, DocumentRepo,
    DocumentScores, ExtendedVoteType, KarmaChange, ModerationLog, ModeratorActionType,
    ScoreMilestones, User, UserId, UserRepo, Vote, VoteReader, VoteStore, VoteTally,
    VoteTransaction, VoteType, VoteableDocument,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../migrations/0001_voting.sql");

const VOTE_COLUMNS: &str = "id, collection_name, document_id, user_id, author_ids, vote_type, power, \
                            extended_vote_type, voted_at, cancelled, is_unvote";

const DOCUMENT_COLUMNS: &str =
    "collection_name, id, user_id, coauthor_user_ids, base_score, vote_count, score, extended_score, kind";

fn vote_from_row(row: &PgRow) -> anyhow::Result<Vote> {
    Ok(Vote {
        id: row.try_get("id")?,
        collection_name: row.try_get::<String, _>("collection_name")?.parse()?,
        document_id: row.try_get("document_id")?,
        user_id: row.try_get("user_id")?,
        author_ids: row.try_get("author_ids")?,
        vote_type: row.try_get::<String, _>("vote_type")?.parse()?,
        power: row.try_get("power")?,
        extended_vote_type: row
            .try_get::<Option<Json<ExtendedVoteType>>, _>("extended_vote_type")?
            .map(|reactions| reactions.0),
        voted_at: row.try_get("voted_at")?,
        cancelled: row.try_get("cancelled")?,
        is_unvote: row.try_get("is_unvote")?,
    })
}

fn document_from_row(row: &PgRow) -> anyhow::Result<VoteableDocument> {
    Ok(VoteableDocument {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        coauthor_user_ids: row.try_get("coauthor_user_ids")?,
        scores: DocumentScores {
            base_score: row.try_get("base_score")?,
            vote_count: row.try_get("vote_count")?,
            score: row.try_get("score")?,
            extended_score: row.try_get::<Json<BTreeMap<String, i64>>, _>("extended_score")?.0,
        },
        kind: row.try_get::<Json<DocumentKind>, _>("kind")?.0,
    })
}

fn user_from_row(row: &PgRow) -> anyhow::Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        karma: row.try_get("karma")?,
        groups: row.try_get::<Vec<String>, _>("groups")?.into_iter().collect::<BTreeSet<_>>(),
        votes_cast: row.try_get::<Json<VoteTally>, _>("votes_cast")?.0,
        votes_received: row.try_get::<Json<VoteTally>, _>("votes_received")?.0,
        banned: row.try_get("banned")?,
        is_admin: row.try_get("is_admin")?,
    })
}

/// sqlx-backed implementation of every storage port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn connect(url: &str, max_connections: u32, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool, clock))
    }

    /// Creates missing tables and indexes.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("voting schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert_user(&self, user: &User) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO users (id, karma, groups, votes_cast, votes_received, banned, is_admin) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(user.id)
        .bind(user.karma)
        .bind(user.groups.iter().cloned().collect::<Vec<_>>())
        .bind(Json(user.votes_cast))
        .bind(Json(user.votes_received))
        .bind(user.banned)
        .bind(user.is_admin)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_document(&self, document: &VoteableDocument) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO documents (collection_name, id, user_id, coauthor_user_ids, base_score, vote_count, \
             score, extended_score, kind) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(document.collection().as_str())
        .bind(document.id)
        .bind(document.user_id)
        .bind(&document.coauthor_user_ids)
        .bind(document.scores.base_score)
        .bind(document.scores.vote_count)
        .bind(document.scores.score)
        .bind(Json(&document.scores.extended_score))
        .bind(Json(&document.kind))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentRepo for PgStore {
    async fn get_voteable_document(
        &self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<Option<VoteableDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection_name = $1 AND id = $2"
        ))
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_active_dated_documents(
        &self,
        collection: CollectionName,
    ) -> anyhow::Result<Vec<VoteableDocument>> {
        let rows = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection_name = $1"))
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut documents = Vec::with_capacity(rows.len());
        for row in &rows {
            let document = document_from_row(row)?;
            if document.posted_at().is_some() && !document.is_inactive() {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    async fn update_decayed_score(
        &self,
        collection: CollectionName,
        id: DocumentId,
        score: f64,
        inactive: bool,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT kind FROM documents WHERE collection_name = $1 AND id = $2 FOR UPDATE")
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{collection} document {id} does not exist"))?;

        let mut kind = row.try_get::<Json<DocumentKind>, _>("kind")?.0;
        match &mut kind {
            DocumentKind::Post(p) => p.inactive = inactive,
            DocumentKind::Comment(c) => c.inactive = inactive,
            DocumentKind::Revision(_) | DocumentKind::Tag => {}
        }

        sqlx::query("UPDATE documents SET score = $3, kind = $4 WHERE collection_name = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .bind(score)
            .bind(Json(&kind))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepo for PgStore {
    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn fetch_document_authors(&self, document: &VoteableDocument) -> anyhow::Result<Vec<User>> {
        let ids = document.author_ids();
        let rows = sqlx::query("SELECT * FROM users WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
        let mut authors = rows.iter().map(user_from_row).collect::<anyhow::Result<Vec<_>>>()?;
        authors.sort_by_key(|u| ids.iter().position(|id| *id == u.id));
        Ok(authors)
    }
}

#[async_trait]
impl VoteReader for PgStore {
    async fn canonical_vote(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> anyhow::Result<Option<Vote>> {
        let row = sqlx::query(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE collection_name = $1 AND document_id = $2 \
             AND user_id = $3 AND NOT cancelled ORDER BY voted_at DESC, id DESC LIMIT 1"
        ))
        .bind(collection.as_str())
        .bind(document_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(vote_from_row).transpose()
    }

    async fn recent_votes_by_user(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Vote>> {
        let rows = sqlx::query(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE user_id = $1 AND voted_at >= $2 AND NOT cancelled"
        ))
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    async fn votes_on_post_comments(
        &self,
        user_id: UserId,
        post_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>> {
        let rows = sqlx::query(
            "SELECT v.* FROM votes v JOIN documents d \
               ON d.collection_name = 'Comments' AND d.id = v.document_id \
             WHERE v.user_id = $1 AND v.collection_name = 'Comments' AND NOT v.cancelled \
               AND (d.kind -> 'Comment' ->> 'post_id')::uuid = $2",
        )
        .bind(user_id)
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    async fn live_votes_by_user(&self, user_id: UserId) -> anyhow::Result<Vec<Vote>> {
        let rows = sqlx::query(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE user_id = $1 AND NOT cancelled ORDER BY voted_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    async fn live_votes_on_document(
        &self,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>> {
        let rows = sqlx::query(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE collection_name = $1 AND document_id = $2 AND NOT cancelled"
        ))
        .bind(collection.as_str())
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }
}

#[async_trait]
impl VoteStore for PgStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn VoteTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgVoteTransaction { tx }))
    }
}

#[async_trait]
impl ModerationLog for PgStore {
    async fn create_moderator_action(
        &self,
        user_id: UserId,
        action_type: ModeratorActionType,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO moderator_actions (id, user_id, action_type, created_at) VALUES ($1, $2, $3, $4)")
            .bind(Uuid::now_v7())
            .bind(user_id)
            .bind(action_type.as_str())
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_recent_action(
        &self,
        user_id: UserId,
        action_type: ModeratorActionType,
        since: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM moderator_actions \
             WHERE user_id = $1 AND action_type = $2 AND created_at >= $3) AS found",
        )
        .bind(user_id)
        .bind(action_type.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }
}

/// A vote transaction on one pooled connection. Dropping it rolls back.
pub struct PgVoteTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl VoteTransaction for PgVoteTransaction {
    async fn insert_vote(&mut self, vote: &Vote) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO votes ({VOTE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(vote.id)
        .bind(vote.collection_name.as_str())
        .bind(vote.document_id)
        .bind(vote.user_id)
        .bind(&vote.author_ids)
        .bind(vote.vote_type.as_str())
        .bind(vote.power)
        .bind(vote.extended_vote_type.as_ref().map(Json))
        .bind(vote.voted_at)
        .bind(vote.cancelled)
        .bind(vote.is_unvote)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn live_votes(
        &mut self,
        collection: CollectionName,
        document_id: DocumentId,
        user_id: UserId,
    ) -> anyhow::Result<Vec<Vote>> {
        let rows = sqlx::query(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE collection_name = $1 AND document_id = $2 \
             AND user_id = $3 AND NOT cancelled ORDER BY voted_at, id"
        ))
        .bind(collection.as_str())
        .bind(document_id)
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    async fn active_votes_for_document(
        &mut self,
        collection: CollectionName,
        document_id: DocumentId,
    ) -> anyhow::Result<Vec<Vote>> {
        let rows = sqlx::query(&format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE collection_name = $1 AND document_id = $2 AND NOT cancelled"
        ))
        .bind(collection.as_str())
        .bind(document_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    async fn try_cancel_vote(&mut self, vote_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE votes SET cancelled = true WHERE id = $1 AND cancelled = false")
            .bind(vote_id)
            .execute(&mut *self.tx)
            .await?;
        debug!(%vote_id, rows = result.rows_affected(), "conditional cancel");
        Ok(result.rows_affected() == 1)
    }

    async fn load_document(
        &mut self,
        collection: CollectionName,
        id: DocumentId,
    ) -> anyhow::Result<Option<VoteableDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection_name = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn write_document_scores(
        &mut self,
        collection: CollectionName,
        id: DocumentId,
        scores: &DocumentScores,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET base_score = $3, vote_count = $4, score = $5, extended_score = $6 \
             WHERE collection_name = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(scores.base_score)
        .bind(scores.vote_count)
        .bind(scores.score)
        .bind(Json(&scores.extended_score))
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("{collection} document {id} does not exist");
        }
        Ok(())
    }

    async fn write_post_milestones(
        &mut self,
        post_id: DocumentId,
        max_base_score: i64,
        milestones: &ScoreMilestones,
    ) -> anyhow::Result<()> {
        let mut post = self
            .load_document(CollectionName::Posts, post_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("post {post_id} does not exist"))?;
        if let DocumentKind::Post(details) = &mut post.kind {
            details.max_base_score = max_base_score;
            details.milestones = milestones.clone();
        }
        sqlx::query("UPDATE documents SET kind = $2 WHERE collection_name = 'Posts' AND id = $1")
            .bind(post_id)
            .bind(Json(&post.kind))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn adjust_karma(&mut self, user_ids: &[UserId], delta: i64) -> anyhow::Result<Vec<KarmaChange>> {
        let rows = sqlx::query("UPDATE users SET karma = karma + $2 WHERE id = ANY($1) RETURNING id, karma, groups")
            .bind(user_ids)
            .bind(delta)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| {
                let new_karma: i64 = row.try_get("karma")?;
                Ok(KarmaChange {
                    user_id: row.try_get("id")?,
                    old_karma: new_karma - delta,
                    new_karma,
                    groups: row.try_get::<Vec<String>, _>("groups")?.into_iter().collect(),
                })
            })
            .collect()
    }

    async fn add_user_group(&mut self, user_id: UserId, group: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET groups = array_append(groups, $2) WHERE id = $1 AND NOT ($2 = ANY(groups))")
            .bind(user_id)
            .bind(group)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn adjust_vote_counters(
        &mut self,
        user_ids: &[UserId],
        direction: CounterDirection,
        vote_type: VoteType,
        amount: i64,
    ) -> anyhow::Result<()> {
        let column = match direction {
            CounterDirection::Cast => "votes_cast",
            CounterDirection::Received => "votes_received",
        };
        let rows = sqlx::query(&format!("SELECT id, {column} AS tally FROM users WHERE id = ANY($1) FOR UPDATE"))
            .bind(user_ids)
            .fetch_all(&mut *self.tx)
            .await?;
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let mut tally = row.try_get::<Json<VoteTally>, _>("tally")?.0;
            tally.adjust(vote_type, amount);
            sqlx::query(&format!("UPDATE users SET {column} = $2 WHERE id = $1"))
                .bind(id)
                .bind(Json(tally))
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let PgVoteTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }
}
