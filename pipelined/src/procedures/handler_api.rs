use crate::apps::{
    CheckQuotaController, Classifier, EnforcementController, EnforcementStats, UeMacController,
};
use crate::data::{Config, ControllerContext, RequestOrigin};
use crate::tables::{RuleVersionTracker, TableAllocator};
use anyhow::Result;
use async_trait::async_trait;
use slog::Logger;

/// Trait representing the collection of services needed by pipelined procedures.
#[async_trait]
pub trait HandlerApi: Send + Sync + Clone + 'static {
    fn config(&self) -> &Config;
    fn context(&self) -> &ControllerContext;
    fn tables(&self) -> &TableAllocator;
    fn versions(&self) -> &RuleVersionTracker;
    fn is_connected(&self) -> bool;

    fn classifier(&self) -> &Classifier;
    fn ue_mac(&self) -> Option<&UeMacController>;
    fn check_quota(&self) -> Option<&CheckQuotaController>;
    fn enforcement(&self, origin: RequestOrigin) -> Option<&EnforcementController>;
    fn enforcement_stats(&self) -> Option<&EnforcementStats>;

    /// Install the table defaults of every app.
    async fn install_default_flows(&self, logger: &Logger) -> Result<()>;
}
