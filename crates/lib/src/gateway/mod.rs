//! Gateway: HTTP server for webhooks, OAuth and the chats admin API.
//!
//! Single port. Webhooks are relayed inline and always acknowledged; see `webhooks`.

mod api;
mod server;
mod webhooks;

pub use api::ApiError;
pub use server::{router, run_gateway, GatewayState};
