pub mod client;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod liveness;
pub mod member;
pub mod models;
pub mod protocol;
pub mod routes;
pub mod signaling;
pub mod state;
pub mod transport;
