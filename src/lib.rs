pub mod api_server;
pub mod clock;
pub mod config;
pub mod heartbeat;
pub mod metrics;
pub mod security;
pub mod storage;
