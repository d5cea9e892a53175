//! Controller/worker job farming over a blocking message-passing transport.
//!
//! One rank owns an ordered stream of work items and hands each to the next
//! worker that asks for one; workers run a user callback per item and send
//! the outcome back. The wire protocol is a handful of tagged messages atop
//! the [`Transport`] trait, so the same farm runs on anything that can do
//! blocking typed send/receive with ranks.

pub mod codec;
mod controller;
pub mod framing;
pub mod job;
pub mod runtime;
pub mod state;
pub mod tags;
pub mod transport;
mod worker;

#[cfg(test)]
mod controller_test;

pub use codec::{BincodeCodec, Codec, CodecError};
pub use framing::{FrameError, DEFAULT_MAX_FRAME};
pub use job::{job_fn, JobError, JobFn, JobHandler};
pub use runtime::{Farm, FarmConfig, FarmError, RunReport};
pub use tags::Tag;
pub use transport::{channel::ChannelTransport, Source, Status, Transport, TransportError};
