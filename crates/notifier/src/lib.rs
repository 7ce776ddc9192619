pub mod breaker;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod recipient;
pub mod retry;
pub mod stream;
pub mod transport;
