pub mod channel;
pub mod delivery;
pub mod lease;
pub mod metrics;
pub mod outbox;
pub mod pipeline;
pub mod scheduler;
pub mod worker;
