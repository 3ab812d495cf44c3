//! HTTP API: server, routing, and request/response mapping for the receiving engine.

pub mod app;
pub mod context;
pub mod middleware;
