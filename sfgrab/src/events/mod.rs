//! Event sink system for observability.
//!
//! The pipeline runner and worker emit lifecycle events (`item.claimed`,
//! `stage.started`, `stage.completed`, `item.failed`, ...) through an
//! [`EventSink`] handed to them at construction.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
