//! Delivery transports used by the dispatcher.
//!
//! - `HttpTransport`: POST the event JSON to the notification endpoint
//! - `QueueTransport`: append the event JSON to a durable stream

mod http;
mod queue;

pub use http::HttpTransport;
pub use queue::QueueTransport;

use async_trait::async_trait;

use linkwatch_common::types::{ChangeEvent, TransportKind};

use crate::error::TransportError;

/// A single way of moving a change event downstream.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Hand the event off once. Retry and breaker logic live in the dispatcher.
    async fn send(&self, event: &ChangeEvent) -> Result<(), TransportError>;
}
