pub mod types;
pub mod upstream;

pub use upstream::{HttpUpstreamClient, Throttle, UpstreamClient};
