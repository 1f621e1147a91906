#![warn(clippy::unwrap_used)]

pub mod analytics_rest;
pub mod rest;
pub mod server;
pub mod webhook_rest;

pub use rest::AppState;
pub use server::{router, ApiServer};
