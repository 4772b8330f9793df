#![warn(missing_docs)]

//! nodelink batcher subsystem: mux/demux event queue, correlated
//! request/response client, batching consumer and batch sinks.

pub mod batcher;
pub mod buffer;
pub mod client;
pub mod error;
pub mod mux_demux;
pub mod sink;

pub use batcher::{Batcher, BatcherConfig};
pub use client::BatcherClient;
pub use error::{BatcherError, Result};
pub use mux_demux::{Message, MuxDemuxQueue};
pub use sink::{BatchResponder, BatchSink, EchoSink, HandlerSink};
