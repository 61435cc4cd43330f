//! The gateway: decision engine, HTTP middleware and server assembly

pub mod engine;
pub mod headers;
pub mod middleware;
pub mod server;

pub use engine::{AccessEngine, Identity, Outcome, RequestFacts};
pub use server::{Gateway, GatewayDeps, demo_downstream};
