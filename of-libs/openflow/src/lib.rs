//! openflow - the subset of OpenFlow that a pipeline controller needs: value-typed
//! matches, actions, flow/meter mods, multipart statistics and a software datapath.

mod actions;
mod fields;
mod messages;
mod soft_switch;
mod switch;

pub use actions::{Action, LearnAction, LearnSpec, LearnSrc};
pub use fields::{FieldKind, FieldValue, FlowMatch, Packet};
pub use messages::*;
pub use soft_switch::{SoftSwitch, Verdict};
pub use switch::Switch;

/// OpenFlow table number.
pub type TableId = u8;

/// Transaction id correlating requests with replies and errors.
pub type Xid = u32;

/// OFPP_LOCAL - the bridge's own port.
pub const LOCAL_PORT: u32 = 0xffff_fffe;
