mod check_quota;
mod classifier;
mod enforcement;
mod enforcement_stats;
mod header_enrichment;
pub mod qos;
pub mod redirect;
mod ue_mac;

pub use check_quota::CheckQuotaController;
pub use classifier::Classifier;
pub use enforcement::{EnforcementController, policy_flow_match};
pub use enforcement_stats::{DEFAULT_DROP_COOKIE, DEFAULT_DROP_RULE_ID, EnforcementStats};
pub use header_enrichment::{EnrichmentProxy, HeController, LogProxy};
pub use ue_mac::{UeMacController, parse_mac};
