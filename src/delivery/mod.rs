//! Delivery of buffered messages to the consumer.
//!
//! Intake runs on its own thread and blocks when the buffer is full, so a
//! slow consumer slows the connection down instead of losing messages.

mod pipeline;

pub use pipeline::{
    DeliveryPipeline, Pending, PipelineParts, PipelineSettings, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_MAX_PENDING, DEFAULT_RESUBSCRIBE_RETRY,
};
