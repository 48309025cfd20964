//! Voting, karma and rate-limiting engine.
//!
//! Everything here is written against the ports in `domains`; the crate holds
//! no storage of its own.

pub mod config;
pub mod karma;
pub mod ledger;
pub mod metrics;
pub mod power;
pub mod rate_limit;
pub mod rescore;
pub mod scoring;
pub mod voting;

pub use config::VotingConfig;
pub use karma::{KarmaPropagator, LoggingKarmaNotifier};
pub use ledger::{CancelledVotes, NewVote, VoteLedger};
pub use metrics::VoteMetrics;
pub use rate_limit::{default_rules, RateLimiter, VoteRateLimitRule};
pub use rescore::{RefreshSummary, ScoreRefresher};
pub use voting::{VoteRequest, VotingPorts, VotingService};
