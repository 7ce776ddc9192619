pub mod metrics_server;
pub mod poller;
pub mod store;
