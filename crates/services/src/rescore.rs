//! Periodic refresh of decayed ranking scores.
//!
//! A document's `score` decays with age even when nobody votes, so a scheduled
//! job recomputes it from the stored base score. Documents past the inactivity
//! age get one final score and are skipped afterwards.

use std::sync::Arc;

use chrono::Duration;
use domains::{Clock, CollectionName, DocumentRepo, Result};
use tracing::{debug, info, instrument};

use crate::scoring::decayed_score;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub deactivated: usize,
}

pub struct ScoreRefresher {
    documents: Arc<dyn DocumentRepo>,
    clock: Arc<dyn Clock>,
    inactive_after: Duration,
}

impl ScoreRefresher {
    pub fn new(documents: Arc<dyn DocumentRepo>, clock: Arc<dyn Clock>, inactive_after: Duration) -> Self {
        Self {
            documents,
            clock,
            inactive_after,
        }
    }

    #[instrument(skip(self))]
    pub async fn refresh(&self, collection: CollectionName) -> Result<RefreshSummary> {
        let now = self.clock.now();
        let mut summary = RefreshSummary::default();

        for document in self.documents.list_active_dated_documents(collection).await? {
            let Some(posted_at) = document.posted_at() else {
                continue;
            };
            let inactive = now - posted_at > self.inactive_after;
            let score = decayed_score(&document, document.scores.base_score, now);
            if !inactive && score == document.scores.score {
                continue;
            }

            self.documents
                .update_decayed_score(collection, document.id, score, inactive)
                .await?;
            if inactive {
                debug!(document_id = %document.id, score, "document went inactive");
                summary.deactivated += 1;
            } else {
                summary.updated += 1;
            }
        }

        info!(updated = summary.updated, deactivated = summary.deactivated, "refreshed decayed scores");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use domains::{
        DocumentKind, DocumentScores, FixedClock, MockDocumentRepo, PostDetails, ScoreMilestones,
        VoteableDocument,
    };
    use uuid::Uuid;

    fn post(posted_at: DateTime<Utc>, base_score: i64, score: f64) -> VoteableDocument {
        VoteableDocument {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            coauthor_user_ids: vec![],
            scores: DocumentScores {
                base_score,
                vote_count: 1,
                score,
                ..Default::default()
            },
            kind: DocumentKind::Post(PostDetails {
                posted_at,
                frontpage_date: None,
                curated_date: None,
                comment_count: 0,
                max_base_score: base_score,
                milestones: ScoreMilestones::default(),
                inactive: false,
            }),
        }
    }

    #[tokio::test]
    async fn test_refresh_updates_and_deactivates() {
        let now = Utc::now();
        let fresh = post(now - Duration::hours(10), 5, 5.0);
        let unchanged = post(now, 1, 0.574349);
        let stale = post(now - Duration::days(45), 20, 3.0);
        let (fresh_id, stale_id) = (fresh.id, stale.id);
        let listed = vec![fresh, unchanged, stale];

        let mut repo = MockDocumentRepo::new();
        repo.expect_list_active_dated_documents()
            .withf(|c| *c == CollectionName::Posts)
            .returning(move |_| Ok(listed.clone()));
        repo.expect_update_decayed_score()
            .withf(move |_, id, score, inactive| *id == fresh_id && !*inactive && *score < 5.0)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        repo.expect_update_decayed_score()
            .withf(move |_, id, _, inactive| *id == stale_id && *inactive)
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let refresher = ScoreRefresher::new(Arc::new(repo), Arc::new(FixedClock::new(now)), Duration::days(30));
        let summary = refresher.refresh(CollectionName::Posts).await.unwrap();
        assert_eq!(summary, RefreshSummary { updated: 1, deactivated: 1 });
    }

    #[tokio::test]
    async fn test_refresh_propagates_storage_errors() {
        let mut repo = MockDocumentRepo::new();
        repo.expect_list_active_dated_documents()
            .returning(|_| Err(anyhow::anyhow!("connection reset")));

        let refresher = ScoreRefresher::new(Arc::new(repo), Arc::new(FixedClock::new(Utc::now())), Duration::days(30));
        let err = refresher.refresh(CollectionName::Comments).await.unwrap_err();
        assert!(matches!(err, domains::VoteError::Storage(_)));
    }
}
