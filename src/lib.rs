pub mod admin;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod http;
pub mod master;
pub mod metrics;
pub mod netid;
pub mod netutils;
pub mod node;
pub mod registry;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
