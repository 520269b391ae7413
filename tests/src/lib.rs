mod mock_collector;
mod mock_dns;
mod mock_proxy;
mod packets;
pub mod framework;

pub use mock_collector::MockCollector;
pub use mock_dns::GatedResolver;
pub use mock_proxy::MockProxy;
pub use packets::{downlink_packet, http_request, proxied_request, uplink_packet};
