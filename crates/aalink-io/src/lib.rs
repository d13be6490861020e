//! I/O substrate for aalink: byte buffers, the unified error type, the
//! work-queue/strand executor model and one-shot promises.
//!
//! Every asynchronous operation in aalink is expressed as a [`Promise`]
//! bound to an [`Executor`]. Components serialize their state by binding
//! promises and posting handlers to a per-component [`Strand`] of the
//! shared [`WorkQueue`]; different components' strands may run on
//! different worker threads in parallel, but no two handlers of one
//! strand ever run concurrently.

pub mod data;
pub mod error;
pub mod executor;
pub mod promise;

pub use data::{view, view_mut, Data};
pub use error::{Error, Result};
pub use executor::{Executor, Strand, WorkQueue};
pub use promise::Promise;
