mod actor;
mod flow_programmer;
pub mod registers;

pub use actor::{ConnectionEvent, Datapath};
pub use flow_programmer::FlowProgrammer;
