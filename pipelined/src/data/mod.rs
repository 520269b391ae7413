mod config;
mod context;
mod errors;
mod policy;
mod store;
mod subscriber;
mod usage;

pub use config::*;
pub use context::*;
pub use errors::*;
pub use policy::*;
pub use store::*;
pub use subscriber::*;
pub use usage::*;
