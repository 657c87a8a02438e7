// Status tracking and notification

pub mod bus;
pub mod events;
pub mod tracker;

pub use bus::{Delivery, EventBus, Subscription};
pub use events::{EventEnvelope, JobEvent, Topic};
pub use tracker::{StatusTracker, Transition};
