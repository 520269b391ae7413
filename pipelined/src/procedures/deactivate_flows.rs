//! deactivate_flows - remove policy rules of a subscriber

use crate::apps::EnforcementController;
use crate::data::{DeactivateFlowsRequest, RequestOrigin, ResultCode, RpcError, RuleId};
use crate::{HandlerApi, Procedure};
use anyhow::Result;
use derive_deref::{Deref, DerefMut};
use slog::{Logger, debug, info, warn};

#[derive(Deref, DerefMut)]
pub struct DeactivateFlowsProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> DeactivateFlowsProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        DeactivateFlowsProcedure(Procedure::new(api, logger))
    }

    // Deactivate Flows Procedure
    // 1.    DeactivateFlowsRequest >>
    // 2.    Decide which rules go, against the versions in force
    // 3.    Remove their enforcement flows and forget their versions
    // 4.    DeactivateFlowsResult <<
    //
    // Counting flows are not removed here.  Once a rule's version is forgotten or bumped,
    // its counting flows are stale and the next stats poll reports and deletes them.  The
    // bumped versions of a deactivate-all are forgotten by that same sweep.
    pub async fn run(&self, mut r: DeactivateFlowsRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> DeactivateFlowsRequest");
        self.ensure_connected()?;
        r.subscriber_id = self.canonical_subscriber_id(&r.subscriber_id)?;

        let engines: Vec<&EnforcementController> = match r.origin {
            RequestOrigin::Gx | RequestOrigin::Gy => self.enforcement(r.origin).into_iter().collect(),
            RequestOrigin::Wildcard => [RequestOrigin::Gy, RequestOrigin::Gx]
                .into_iter()
                .filter_map(|o| self.enforcement(o))
                .collect(),
        };

        let result = if r.policies.is_empty() {
            self.deactivate_subscriber(&r, &engines).await
        } else {
            self.deactivate_rules(&r, &engines).await
        };
        let result = match result {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(
                    self.logger,
                    "Failed to deactivate flows of {} - {e}", r.subscriber_id
                );
                ResultCode::Failure
            }
        };

        if let Some(stats) = self.enforcement_stats() {
            if let Err(e) = stats
                .deactivate_rules(&r.subscriber_id, r.uplink_tunnel, r.remove_default_drop_flows)
                .await
            {
                warn!(
                    self.logger,
                    "Failed to remove default drop of {} - {e}", r.subscriber_id
                );
            }
        }
        self.log_message("<< DeactivateFlowsResult");
        Ok(result)
    }

    async fn deactivate_subscriber(
        &self,
        r: &DeactivateFlowsRequest,
        engines: &[&EnforcementController],
    ) -> Result<()> {
        let tracked = self
            .versions()
            .rules_for_subscriber(&r.subscriber_id, r.uplink_tunnel);
        if tracked.is_empty() {
            debug!(self.logger, "No rules tracked for {}", r.subscriber_id);
            return Ok(());
        }
        let bumped = self
            .versions()
            .update_all_for_subscriber(&r.subscriber_id, r.uplink_tunnel);
        info!(
            self.logger,
            "Deactivating all {} rules of {}", bumped.len(), r.subscriber_id
        );
        for engine in engines.iter() {
            engine
                .deactivate_subscriber(&r.subscriber_id, r.ip_addr, r.uplink_tunnel, &bumped)
                .await?;
        }
        Ok(())
    }

    async fn deactivate_rules(
        &self,
        r: &DeactivateFlowsRequest,
        engines: &[&EnforcementController],
    ) -> Result<()> {
        let mut doomed: Vec<(RuleId, u32)> = vec![];
        for policy in r.policies.iter() {
            let current =
                self.versions()
                    .get_version(&r.subscriber_id, r.uplink_tunnel, &policy.rule_id);
            if current == 0 {
                debug!(
                    self.logger,
                    "Rule {} of {} is not active", policy.rule_id, r.subscriber_id
                );
            } else if current > policy.version {
                info!(
                    self.logger,
                    "Rule {} of {} is at v{current}, leaving it in place (v{} requested)",
                    policy.rule_id,
                    r.subscriber_id,
                    policy.version
                );
            } else {
                doomed.push((policy.rule_id.clone(), current));
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }

        let rule_ids: Vec<RuleId> = doomed.iter().map(|(id, _)| id.clone()).collect();
        for engine in engines.iter() {
            engine
                .deactivate_rules(&r.subscriber_id, r.ip_addr, r.uplink_tunnel, &rule_ids)
                .await?;
        }
        for (rule_id, version) in doomed.iter() {
            self.versions()
                .remove(&r.subscriber_id, r.uplink_tunnel, rule_id, *version);
        }
        Ok(())
    }
}
