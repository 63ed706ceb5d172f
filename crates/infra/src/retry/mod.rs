//! Retry chain: failure classification, backoff and stage routing.

pub mod classifier;
pub mod policy;
pub mod router;

pub use classifier::{classify, ErrorKind, ProcessingError};
pub use policy::{BackoffPolicy, BackoffStrategy};
pub use router::{RetryRouter, RouteOutcome, RouterError};
