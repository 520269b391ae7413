//! quota - subscriber quota state flows

use crate::apps::{CheckQuotaController, parse_mac};
use crate::data::{
    ResultCode, RpcError, SetupKind, SetupQuotaRequest, SubscriberQuotaUpdate,
    UpdateSubscriberQuotaStateRequest,
};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::{Logger, warn};

#[derive(Deref, DerefMut)]
pub struct QuotaProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> QuotaProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        QuotaProcedure(Procedure::new(api, logger))
    }

    fn controller(&self) -> Result<&'a CheckQuotaController, RpcError> {
        self.api
            .check_quota()
            .ok_or_else(|| RpcError::Unavailable("check_quota is not enabled".to_string()))
    }

    fn validate(&self, updates: &[SubscriberQuotaUpdate]) -> Result<(), RpcError> {
        for update in updates.iter() {
            parse_mac(&update.mac_addr)?;
            self.canonical_subscriber_id(&update.sid)?;
        }
        Ok(())
    }

    pub async fn setup(&self, r: SetupQuotaRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> SetupQuotaRequest");
        if !self.check_epoch(r.epoch, SetupKind::Quota) {
            return Ok(ResultCode::OutdatedEpoch);
        }
        self.ensure_connected()?;
        let controller = self.controller()?;
        self.validate(&r.requests)?;
        let result = match controller.handle_restart(&r.requests).await {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(self.logger, "Quota setup failed - {e}");
                ResultCode::Failure
            }
        };
        self.context().mark_setup_done(SetupKind::Quota);
        self.log_message("<< SetupFlowsResult");
        Ok(result)
    }

    pub async fn update(&self, r: UpdateSubscriberQuotaStateRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> UpdateSubscriberQuotaStateRequest");
        if r.updates.is_empty() {
            return Err(RpcError::InvalidArgument("no quota updates".to_string()));
        }
        self.ensure_connected()?;
        self.validate(&r.updates)?;
        let result = match self
            .controller()?
            .update_subscriber_quota_state(&r.updates)
            .await
        {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(self.logger, "Quota update failed - {e}");
                ResultCode::Failure
            }
        };
        self.log_message("<< FlowResponse");
        Ok(result)
    }
}
