// Public API for integration tests and potential library usage

pub mod abuse;
pub mod api;
pub mod archive;
pub mod auth;
pub mod config;
pub mod error;
pub mod files;
pub mod protocol;
pub mod state;
pub mod store;
pub mod types;
