use crate::{OfpMessage, Xid};
use anyhow::Result;
use async_trait::async_trait;

/// The controller's handle on a connected switch.  Replies, errors and connection changes
/// arrive separately as `SwitchEvent`s.
#[async_trait]
pub trait Switch: Send + Sync + 'static {
    async fn send(&self, xid: Xid, message: OfpMessage) -> Result<()>;
}
