pub mod allowlist;
pub mod anomaly;
pub mod envelope;
pub mod freshness;
pub mod payload;
pub mod rate_limit;
pub mod replay;
pub mod signature;

pub use allowlist::AllowlistStage;
pub use anomaly::AnomalyStage;
pub use envelope::EnvelopeStage;
pub use freshness::FreshnessStage;
pub use payload::PayloadStage;
pub use rate_limit::RateLimitStage;
pub use replay::ReplayStage;
pub use signature::SignatureStage;
