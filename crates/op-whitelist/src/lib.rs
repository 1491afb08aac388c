pub mod policy;
pub mod source;

pub use policy::{ParseError, Policy, Rules, parse};
pub use source::{FetchError, PolicySource, WhitelistFetcher};
