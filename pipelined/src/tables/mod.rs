mod rule_ids;
mod rule_versions;
mod table_allocator;

pub use rule_ids::RuleIdRegistry;
pub use rule_versions::{RuleVersionTracker, VersionKey};
pub use table_allocator::{EGRESS_TABLE, Stage, TableAllocator, app_stage};

pub mod app_names {
    pub const CLASSIFIER: &str = "classifier";
    pub const UE_MAC: &str = "ue_mac";
    pub const CHECK_QUOTA: &str = "check_quota";
    pub const HE: &str = "he";
    pub const GY: &str = "gy";
    pub const ENFORCEMENT: &str = "enforcement";
    pub const ENFORCEMENT_STATS: &str = "enforcement_stats";
}
