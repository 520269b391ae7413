mod activate_flows;
mod deactivate_flows;
mod handler_api;
mod policy_usage;
mod procedure;
mod quota;
mod rpc_handler;
mod setup;
mod table_assignments;
mod ue_mac;
mod ue_state;

pub use activate_flows::ActivateFlowsProcedure;
pub use deactivate_flows::DeactivateFlowsProcedure;
pub use handler_api::HandlerApi;
pub use policy_usage::PolicyUsageProcedure;
pub use procedure::Procedure;
pub use quota::QuotaProcedure;
pub use rpc_handler::{PipelinedService, RpcHandler};
pub use setup::SetupProcedure;
pub use table_assignments::TableAssignmentsProcedure;
pub use ue_mac::UeMacProcedure;
pub use ue_state::UeStateProcedure;
