// HTTP surface: render submission and health endpoints.

pub mod handler;
