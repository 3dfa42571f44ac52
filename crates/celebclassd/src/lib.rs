//! celebclassd: HTTP front end for the celebclass pipeline.

pub mod config;
pub mod http;

pub use config::Config;
pub use http::router;
