//! Configuration and error types shared by every stage of the operator.
//!
//! The operator runs in three stages driven by the host runtime: decode the
//! node options into an [`OperatorConfig`] once, prepare once per shape
//! resolution pass, then invoke any number of times. Every stage reports
//! failures through [`AttentionError`].

pub mod config;
pub mod errors;

pub use config::OperatorConfig;
pub use errors::AttentionError;
