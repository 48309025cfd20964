//! Prometheus counters for the voting engine.

use domains::{CollectionName, VoteType};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CastLabels {
    pub collection: String,
    pub vote_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CollectionLabels {
    pub collection: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Deny,
    Flag,
    Warn,
}

impl RateLimitOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RateLimitOutcome::Deny => "deny",
            RateLimitOutcome::Flag => "flag",
            RateLimitOutcome::Warn => "warn",
        }
    }
}

#[derive(Clone, Default)]
pub struct VoteMetrics {
    pub votes_cast: Family<CastLabels, Counter>,
    pub votes_cancelled: Family<CollectionLabels, Counter>,
    pub rate_limit: Family<OutcomeLabels, Counter>,
}

impl VoteMetrics {
    /// Creates the counters and registers them into `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("votes_cast", "Votes cast, by collection and vote type", metrics.votes_cast.clone());
        registry.register(
            "votes_cancelled",
            "Votes cancelled, by collection",
            metrics.votes_cancelled.clone(),
        );
        registry.register(
            "vote_rate_limit",
            "Rate-limit consequences applied to votes",
            metrics.rate_limit.clone(),
        );
        metrics
    }

    pub fn record_cast(&self, collection: CollectionName, vote_type: VoteType) {
        self.votes_cast
            .get_or_create(&CastLabels {
                collection: collection.as_str().to_string(),
                vote_type: vote_type.as_str().to_string(),
            })
            .inc();
    }

    pub fn record_cancelled(&self, collection: CollectionName, count: u64) {
        self.votes_cancelled
            .get_or_create(&CollectionLabels {
                collection: collection.as_str().to_string(),
            })
            .inc_by(count);
    }

    pub fn record_rate_limit(&self, outcome: RateLimitOutcome) {
        self.rate_limit
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_counters_are_exported() {
        let mut registry = Registry::default();
        let metrics = VoteMetrics::register(&mut registry);
        metrics.record_cast(CollectionName::Posts, VoteType::SmallUpvote);
        metrics.record_cast(CollectionName::Posts, VoteType::SmallUpvote);
        metrics.record_cancelled(CollectionName::Comments, 3);
        metrics.record_rate_limit(RateLimitOutcome::Deny);

        let cast = metrics
            .votes_cast
            .get_or_create(&CastLabels {
                collection: "Posts".to_string(),
                vote_type: "smallUpvote".to_string(),
            })
            .get();
        assert_eq!(cast, 2);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("votes_cast_total"));
        assert!(out.contains("votes_cancelled_total"));
        assert!(out.contains("outcome=\"deny\""));
    }
}
