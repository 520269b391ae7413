//! rpc_handler - control service entry points

use super::{
    ActivateFlowsProcedure, DeactivateFlowsProcedure, PolicyUsageProcedure, QuotaProcedure,
    SetupProcedure, TableAssignmentsProcedure, UeMacProcedure, UeStateProcedure,
};
use crate::HandlerApi;
use crate::data::{
    ActivateFlowsRequest, ActivateFlowsResult, DeactivateFlowsRequest, PolicyResult, ResultCode,
    RpcError, RuleRecordTable, SetupPolicyRequest, SetupQuotaRequest, SetupUeMacRequest,
    TableAssignment, UeMacFlowRequest, UeSessionSet, UpdateSubscriberQuotaStateRequest,
};
use async_std::future::timeout;
use async_trait::async_trait;
use slog::{Logger, o, warn};
use std::future::Future;

/// The control service that the session manager calls.
#[async_trait]
pub trait PipelinedService: Send + Sync {
    async fn setup_default_controllers(&self, epoch: u64) -> Result<ResultCode, RpcError>;
    async fn setup_policy_flows(&self, r: SetupPolicyRequest) -> Result<ResultCode, RpcError>;
    async fn activate_flows(
        &self,
        r: ActivateFlowsRequest,
    ) -> Result<ActivateFlowsResult, RpcError>;
    async fn deactivate_flows(&self, r: DeactivateFlowsRequest) -> Result<ResultCode, RpcError>;
    async fn get_policy_usage(&self) -> Result<RuleRecordTable, RpcError>;
    async fn setup_ue_mac_flows(&self, r: SetupUeMacRequest) -> Result<ResultCode, RpcError>;
    async fn add_ue_mac_flow(&self, r: UeMacFlowRequest) -> Result<ResultCode, RpcError>;
    async fn delete_ue_mac_flow(&self, r: UeMacFlowRequest) -> Result<ResultCode, RpcError>;
    async fn setup_quota_flows(&self, r: SetupQuotaRequest) -> Result<ResultCode, RpcError>;
    async fn update_subscriber_quota_state(
        &self,
        r: UpdateSubscriberQuotaStateRequest,
    ) -> Result<ResultCode, RpcError>;
    async fn update_ue_state(&self, r: UeSessionSet) -> Result<ResultCode, RpcError>;
    async fn get_all_table_assignments(&self) -> Result<Vec<TableAssignment>, RpcError>;
}

/// Runs each call as its own task.  A call that overruns the RPC deadline is answered
/// straight away, but its task carries on to completion.
#[derive(Clone)]
pub struct RpcHandler<A: HandlerApi> {
    api: A,
    logger: Logger,
}

impl<A: HandlerApi> RpcHandler<A> {
    pub fn new(api: A, logger: &Logger) -> Self {
        RpcHandler {
            api,
            logger: logger.clone(),
        }
    }

    async fn detached<T, F, Fut>(&self, rpc: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(A, Logger) -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
    {
        let logger = self.logger.new(o!("rpc" => rpc));
        let handle = async_std::task::spawn(f(self.api.clone(), logger));
        match timeout(self.api.config().rpc_timeout(), handle).await {
            Ok(t) => Some(t),
            Err(_) => {
                warn!(self.logger, "{rpc} overran its deadline");
                None
            }
        }
    }
}

#[async_trait]
impl<A: HandlerApi> PipelinedService for RpcHandler<A> {
    async fn setup_default_controllers(&self, epoch: u64) -> Result<ResultCode, RpcError> {
        self.detached("SetupDefaultControllers", move |api, logger| async move {
            SetupProcedure::new(&api, &logger)
                .default_controllers(epoch)
                .await
        })
        .await
        .unwrap_or(Ok(ResultCode::Failure))
    }

    async fn setup_policy_flows(&self, r: SetupPolicyRequest) -> Result<ResultCode, RpcError> {
        self.detached("SetupPolicyFlows", move |api, logger| async move {
            SetupProcedure::new(&api, &logger).policy_flows(r).await
        })
        .await
        .unwrap_or(Ok(ResultCode::Failure))
    }

    async fn activate_flows(
        &self,
        r: ActivateFlowsRequest,
    ) -> Result<ActivateFlowsResult, RpcError> {
        let failed = ActivateFlowsResult {
            policy_results: r.policies.iter().map(PolicyResult::failure).collect(),
        };
        self.detached("ActivateFlows", move |api, logger| async move {
            ActivateFlowsProcedure::new(&api, &logger).run(r).await
        })
        .await
        .unwrap_or(Ok(failed))
    }

    async fn deactivate_flows(&self, r: DeactivateFlowsRequest) -> Result<ResultCode, RpcError> {
        self.detached("DeactivateFlows", move |api, logger| async move {
            DeactivateFlowsProcedure::new(&api, &logger).run(r).await
        })
        .await
        .unwrap_or(Ok(ResultCode::Failure))
    }

    async fn get_policy_usage(&self) -> Result<RuleRecordTable, RpcError> {
        self.detached("GetPolicyUsage", move |api, logger| async move {
            PolicyUsageProcedure::new(&api, &logger).run().await
        })
        .await
        .unwrap_or(Err(RpcError::DeadlineExceeded))
    }

    async fn setup_ue_mac_flows(&self, r: SetupUeMacRequest) -> Result<ResultCode, RpcError> {
        self.detached("SetupUEMacFlows", move |api, logger| async move {
            UeMacProcedure::new(&api, &logger).setup(r).await
        })
        .await
        .unwrap_or(Ok(ResultCode::Failure))
    }

    async fn add_ue_mac_flow(&self, r: UeMacFlowRequest) -> Result<ResultCode, RpcError> {
        self.detached("AddUEMacFlow", move |api, logger| async move {
            UeMacProcedure::new(&api, &logger).add(r).await
        })
        .await
        .unwrap_or(Err(RpcError::DeadlineExceeded))
    }

    async fn delete_ue_mac_flow(&self, r: UeMacFlowRequest) -> Result<ResultCode, RpcError> {
        self.detached("DeleteUEMacFlow", move |api, logger| async move {
            UeMacProcedure::new(&api, &logger).delete(r).await
        })
        .await
        .unwrap_or(Err(RpcError::DeadlineExceeded))
    }

    async fn setup_quota_flows(&self, r: SetupQuotaRequest) -> Result<ResultCode, RpcError> {
        self.detached("SetupQuotaFlows", move |api, logger| async move {
            QuotaProcedure::new(&api, &logger).setup(r).await
        })
        .await
        .unwrap_or(Ok(ResultCode::Failure))
    }

    async fn update_subscriber_quota_state(
        &self,
        r: UpdateSubscriberQuotaStateRequest,
    ) -> Result<ResultCode, RpcError> {
        self.detached("UpdateSubscriberQuotaState", move |api, logger| async move {
            QuotaProcedure::new(&api, &logger).update(r).await
        })
        .await
        .unwrap_or(Err(RpcError::DeadlineExceeded))
    }

    async fn update_ue_state(&self, r: UeSessionSet) -> Result<ResultCode, RpcError> {
        self.detached("UpdateUEState", move |api, logger| async move {
            UeStateProcedure::new(&api, &logger).run(r).await
        })
        .await
        .unwrap_or(Err(RpcError::DeadlineExceeded))
    }

    async fn get_all_table_assignments(&self) -> Result<Vec<TableAssignment>, RpcError> {
        TableAssignmentsProcedure::new(&self.api, &self.logger).run()
    }
}
