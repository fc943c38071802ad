//! HTTP surface for the admission engine.

mod server;
mod service;

pub use server::HttpServer;
pub use service::router;
