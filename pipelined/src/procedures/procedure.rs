use super::HandlerApi;
use crate::data::{RpcError, SetupKind, decode_imsi, encode_imsi};
use slog::{Logger, debug, warn};

pub struct Procedure<'a, A: HandlerApi> {
    pub api: &'a A,
    pub logger: &'a Logger,
}

impl<'a, A: HandlerApi> Procedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        Procedure { api, logger }
    }

    pub fn log_message(&self, s: &str) {
        debug!(self.logger, "{}", s)
    }

    pub fn ensure_connected(&self) -> Result<(), RpcError> {
        if self.api.is_connected() {
            Ok(())
        } else {
            Err(RpcError::Unavailable("datapath not connected".to_string()))
        }
    }

    /// A setup request from a superseded controller generation is refused.
    pub fn check_epoch(&self, epoch: u64, kind: SetupKind) -> bool {
        if self.api.context().is_current_epoch(epoch) {
            return true;
        }
        warn!(
            self.logger,
            "{kind:?} setup with epoch {epoch}, current epoch is {}",
            self.api.context().epoch()
        );
        false
    }

    /// The form of the subscriber id that the stats table reports usage under.
    pub fn canonical_subscriber_id(&self, subscriber_id: &str) -> Result<String, RpcError> {
        Ok(decode_imsi(encode_imsi(subscriber_id)?))
    }
}

impl<A: HandlerApi> std::ops::Deref for Procedure<'_, A> {
    type Target = A;

    fn deref(&self) -> &Self::Target {
        self.api
    }
}
