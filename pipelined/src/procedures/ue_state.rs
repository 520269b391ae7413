//! ue_state - GTP tunnel install and removal

use crate::data::{ResultCode, RpcError, UeSessionSet};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::{Logger, warn};

#[derive(Deref, DerefMut)]
pub struct UeStateProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> UeStateProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        UeStateProcedure(Procedure::new(api, logger))
    }

    pub async fn run(&self, mut r: UeSessionSet) -> Result<ResultCode, RpcError> {
        self.log_message(">> UESessionSet");
        self.ensure_connected()?;
        r.subscriber_id = self.canonical_subscriber_id(&r.subscriber_id)?;
        let result = match self.classifier().update_ue_state(&r).await {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(
                    self.logger,
                    "Failed to update tunnel of {} - {e}", r.subscriber_id
                );
                ResultCode::Failure
            }
        };
        self.log_message("<< UESessionContextResponse");
        Ok(result)
    }
}
