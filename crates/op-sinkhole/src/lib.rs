pub mod browser;
pub mod digest;
pub mod dnsmasq;
pub mod probe;
pub mod render;
pub mod upstream;

pub use digest::Digest;
pub use render::{RenderedArtifacts, render};
pub use upstream::UpstreamDns;
