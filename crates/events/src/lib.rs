//! Person pipeline events and the broker contract they travel over.

pub mod broker;
pub mod envelope;
pub mod event;
pub mod headers;
pub mod in_memory_broker;

pub use broker::{ConsumerRecord, MessageBroker, ProducerRecord};
pub use envelope::{EventEnvelope, PersonEnvelope};
pub use event::{DebtCalculation, EventType, PersonPayload};
pub use headers::Headers;
pub use in_memory_broker::{InMemoryBroker, InMemoryBrokerError};
