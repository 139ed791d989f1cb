pub mod app;
pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod form;
pub mod log_sanitize;
pub mod logging;
pub mod notify;
pub mod prompt;
pub mod results;
pub mod service;
pub mod ui;
pub mod welcome;

pub use error::{Error, Result};
