//! chatrelay core library: webhook normalization, reply selection, outbound dispatch
//! to Kommo and Wazzup, credential storage, and the HTTP gateway used by the CLI.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod normalize;
pub mod oauth;
pub mod relay;
pub mod reply;
pub mod signing;
pub mod store;
