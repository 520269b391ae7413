//! ue_mac - MAC based subscriber flows

use crate::apps::{UeMacController, parse_mac};
use crate::data::{ResultCode, RpcError, SetupKind, SetupUeMacRequest, UeMacFlowRequest};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::{Logger, warn};

#[derive(Deref, DerefMut)]
pub struct UeMacProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> UeMacProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        UeMacProcedure(Procedure::new(api, logger))
    }

    fn controller(&self) -> Result<&'a UeMacController, RpcError> {
        self.api
            .ue_mac()
            .ok_or_else(|| RpcError::Unavailable("ue_mac is not enabled".to_string()))
    }

    fn validate(&self, request: &UeMacFlowRequest) -> Result<(), RpcError> {
        parse_mac(&request.mac_addr)?;
        self.canonical_subscriber_id(&request.sid)?;
        Ok(())
    }

    fn result(&self, result: anyhow::Result<()>, what: &str) -> ResultCode {
        match result {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(self.logger, "{what} failed - {e}");
                ResultCode::Failure
            }
        }
    }

    pub async fn setup(&self, r: SetupUeMacRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> SetupUEMacRequest");
        if !self.check_epoch(r.epoch, SetupKind::UeMac) {
            return Ok(ResultCode::OutdatedEpoch);
        }
        self.ensure_connected()?;
        let controller = self.controller()?;
        for request in r.requests.iter() {
            self.validate(request)?;
        }
        let result = self.result(controller.handle_restart(&r.requests).await, "UE MAC setup");
        self.context().mark_setup_done(SetupKind::UeMac);
        self.log_message("<< SetupFlowsResult");
        Ok(result)
    }

    pub async fn add(&self, r: UeMacFlowRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> AddUEMacFlow");
        self.ensure_connected()?;
        self.validate(&r)?;
        let result = self.result(self.controller()?.add_ue_mac_flow(&r).await, "Add UE MAC flow");
        self.log_message("<< FlowResponse");
        Ok(result)
    }

    pub async fn delete(&self, r: UeMacFlowRequest) -> Result<ResultCode, RpcError> {
        self.log_message(">> DeleteUEMacFlow");
        self.ensure_connected()?;
        self.validate(&r)?;
        let result = self.result(
            self.controller()?.delete_ue_mac_flow(&r).await,
            "Delete UE MAC flow",
        );
        self.log_message("<< FlowResponse");
        Ok(result)
    }
}
