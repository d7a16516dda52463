pub mod block;
pub mod catalog;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod error;
pub mod export;
pub mod graphql;
pub mod logging;
pub mod metadata;
pub mod postprocess;
pub mod record;
pub mod record_store;
#[cfg(feature = "s3")]
pub mod remote;
pub mod runner;
pub mod source;
pub mod warehouse;
pub mod workspace;

pub use error::*;
