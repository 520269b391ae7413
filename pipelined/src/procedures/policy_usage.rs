//! policy_usage - on-demand read of cumulative rule usage

use crate::data::{RpcError, RuleRecordTable};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::{Logger, warn};

#[derive(Deref, DerefMut)]
pub struct PolicyUsageProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> PolicyUsageProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        PolicyUsageProcedure(Procedure::new(api, logger))
    }

    pub async fn run(&self) -> Result<RuleRecordTable, RpcError> {
        self.log_message(">> GetPolicyUsage");
        self.ensure_connected()?;
        let Some(stats) = self.enforcement_stats() else {
            return Err(RpcError::Unavailable("enforcement_stats is not enabled".to_string()));
        };
        let table = stats.get_policy_usage().await.map_err(|e| {
            warn!(self.logger, "Failed to read policy usage - {e}");
            RpcError::Unavailable(e.to_string())
        })?;
        self.log_message("<< RuleRecordTable");
        Ok(table)
    }
}
