//! setup - full-state replay from the session manager after either side restarts

use super::ActivateFlowsProcedure;
use crate::data::{
    ActivateFlowsRequest, PolicyResult, RequestOrigin, ResultCode, RpcError, RuleId, SetupKind,
    SetupPolicyRequest,
};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::{Logger, info, warn};
use std::collections::HashSet;

#[derive(Deref, DerefMut)]
pub struct SetupProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> SetupProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        SetupProcedure(Procedure::new(api, logger))
    }

    pub async fn default_controllers(&self, epoch: u64) -> Result<ResultCode, RpcError> {
        self.log_message(">> SetupDefaultControllers");
        if !self.check_epoch(epoch, SetupKind::Policy) {
            return Ok(ResultCode::OutdatedEpoch);
        }
        self.ensure_connected()?;
        let result = match self.install_default_flows(self.logger).await {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(self.logger, "Failed to install default flows - {e}");
                ResultCode::Failure
            }
        };
        self.log_message("<< SetupDefaultControllers");
        Ok(result)
    }

    // Setup Policy Flows Procedure
    // 1.    SetupPolicyRequest >>
    // 2.    Record the rule versions of every subscriber
    // 3.    Rebuild the stats table
    // 4.    Rebuild the Gy and Gx tables, leaving out rules whose counting flows failed
    // 5.    SetupFlowsResult <<
    pub async fn policy_flows(&self, r: SetupPolicyRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> SetupPolicyRequest");
        if !self.check_epoch(r.epoch, SetupKind::Policy) {
            return Ok(ResultCode::OutdatedEpoch);
        }
        self.ensure_connected()?;

        let activate = ActivateFlowsProcedure::new(self.api, self.logger);
        let mut requests = vec![];
        for request in r.requests.into_iter() {
            requests.push(activate.accept_versions(activate.validate(request)?));
        }
        info!(
            self.logger,
            "Replaying policies of {} subscribers", requests.len()
        );

        let mut results: Vec<PolicyResult> = vec![];
        if let Some(stats) = self.enforcement_stats() {
            let counted = stats.handle_restart(&requests).await;
            results.extend(exclude_uncounted(&mut requests, &counted));
        }

        for origin in [RequestOrigin::Gy, RequestOrigin::Gx] {
            let Some(enforcement) = self.enforcement(origin) else {
                continue;
            };
            let of_origin: Vec<ActivateFlowsRequest> = requests
                .iter()
                .filter(|r| r.origin == origin)
                .cloned()
                .collect();
            results.extend(enforcement.handle_restart(&of_origin).await);
        }

        self.context().mark_setup_done(SetupKind::Policy);
        let result = if results.iter().all(|r| r.result == ResultCode::Success) {
            ResultCode::Success
        } else {
            ResultCode::Failure
        };
        self.log_message("<< SetupFlowsResult");
        Ok(result)
    }
}

/// Take out of each request the rules whose counting flows failed, and return their
/// failures.  `counted` holds the stats results per request, in request order.
fn exclude_uncounted(
    requests: &mut [ActivateFlowsRequest],
    counted: &[Vec<PolicyResult>],
) -> Vec<PolicyResult> {
    let mut failed: HashSet<(String, u32, RuleId)> = HashSet::new();
    let mut failures = vec![];
    for (request, results) in requests.iter().zip(counted.iter()) {
        for c in results.iter().filter(|c| c.result != ResultCode::Success) {
            failed.insert((request.subscriber_id.clone(), request.uplink_tunnel, c.rule_id.clone()));
            failures.push(c.clone());
        }
    }
    for request in requests.iter_mut() {
        let (subscriber_id, teid) = (request.subscriber_id.clone(), request.uplink_tunnel);
        request
            .policies
            .retain(|p| !failed.contains(&(subscriber_id.clone(), teid, p.rule.id.clone())));
    }
    failures
}
