//! activate_flows - install the policy rules of a subscriber

use crate::data::{
    ActivateFlowsRequest, ActivateFlowsResult, PolicyResult, RequestOrigin, ResultCode, RpcError,
};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::{Logger, info};
use std::collections::HashSet;

#[derive(Deref, DerefMut)]
pub struct ActivateFlowsProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> ActivateFlowsProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        ActivateFlowsProcedure(Procedure::new(api, logger))
    }

    // Activate Flows Procedure
    // 1.    ActivateFlowsRequest >>
    // 2.    Record the rule versions
    // 3.    Install counting flows
    // 4.    Install enforcement flows for the rules whose counting flows went in
    // 5.    ActivateFlowsResult <<
    pub async fn run(&self, r: ActivateFlowsRequest) -> Result<ActivateFlowsResult, RpcError> {
        self.log_message(">> ActivateFlowsRequest");
        self.ensure_connected()?;
        let r = self.validate(r)?;
        if self.enforcement(r.origin).is_none() {
            return Err(RpcError::Unavailable(format!(
                "no enforcement app for {:?}",
                r.origin
            )));
        }
        info!(
            self.logger,
            "Activate {} rules for {} teid {:#x} ({:?})",
            r.policies.len(),
            r.subscriber_id,
            r.uplink_tunnel,
            r.origin
        );
        let r = self.accept_versions(r);
        let policy_results = self.install(&r).await;
        self.log_message("<< ActivateFlowsResult");
        Ok(ActivateFlowsResult { policy_results })
    }

    pub fn validate(&self, mut r: ActivateFlowsRequest) -> Result<ActivateFlowsRequest, RpcError> {
        if r.origin == RequestOrigin::Wildcard {
            return Err(RpcError::InvalidArgument(
                "activation must come from Gx or Gy".to_string(),
            ));
        }
        r.subscriber_id = self.canonical_subscriber_id(&r.subscriber_id)?;
        if r.policies.iter().any(|p| p.rule.id.is_empty()) {
            return Err(RpcError::InvalidArgument("policy rule without id".to_string()));
        }
        Ok(r)
    }

    /// Record each policy's version.  A request carrying an older version than the one in
    /// force installs the newer one.
    pub fn accept_versions(&self, mut r: ActivateFlowsRequest) -> ActivateFlowsRequest {
        for policy in r.policies.iter_mut() {
            policy.version = self.versions().save_version(
                &r.subscriber_id,
                r.uplink_tunnel,
                &policy.rule.id,
                policy.version,
            );
        }
        r
    }

    async fn install(&self, r: &ActivateFlowsRequest) -> Vec<PolicyResult> {
        let Some(enforcement) = self.enforcement(r.origin) else {
            return r.policies.iter().map(PolicyResult::failure).collect();
        };
        let counted = match self.enforcement_stats() {
            Some(stats) => stats.activate_rules(r).await,
            None => r
                .policies
                .iter()
                .map(|p| PolicyResult::new(&p.rule.id, p.version, true))
                .collect(),
        };
        let failed: HashSet<&str> = counted
            .iter()
            .filter(|result| result.result != ResultCode::Success)
            .map(|result| result.rule_id.as_str())
            .collect();

        let mut enforced = r.clone();
        enforced
            .policies
            .retain(|p| !failed.contains(p.rule.id.as_str()));
        let mut results = enforcement.activate_rules(&enforced).await.into_iter();

        // One result per policy, in request order.
        r.policies
            .iter()
            .map(|p| {
                if failed.contains(p.rule.id.as_str()) {
                    PolicyResult::failure(p)
                } else {
                    results.next().unwrap_or_else(|| PolicyResult::failure(p))
                }
            })
            .collect()
    }
}
