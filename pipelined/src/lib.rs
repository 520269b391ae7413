mod apps;
mod data;
mod datapath;
mod pipelined;
mod procedures;
mod tables;

use procedures::{HandlerApi, Procedure};

pub use apps::redirect::{Resolver, SystemResolver};
pub use apps::{EnrichmentProxy, LogProxy};
pub use apps::{DEFAULT_DROP_COOKIE, DEFAULT_DROP_RULE_ID, policy_flow_match};
pub use data::*;
pub use datapath::registers;
pub use pipelined::Pipelined;
pub use procedures::{PipelinedService, RpcHandler};
pub use tables::{EGRESS_TABLE, app_names};
