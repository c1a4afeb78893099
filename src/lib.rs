pub mod api;
pub mod config;
pub mod engine;
pub mod server;
pub mod source;
pub mod submit;
pub mod telemetry;
