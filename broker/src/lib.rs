//! The capability broker: the single mandatory gate between the agent and
//! the host. Classifies every proposed operation, validates it against the
//! scope boundary, snapshots mutating tiers, executes under a deadline,
//! audits start and end, and enqueues the outcome notification.

mod classifier;
mod router;
mod scope;

pub use classifier::classify_tier;
pub use router::BrokerRouter;
pub use router::denial_text;
pub use scope::ScopeValidator;
