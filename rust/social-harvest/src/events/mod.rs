//! In-process event distribution.
//!
//! Harvest adapters publish [`HarvestEvent`](crate::domain::HarvestEvent)s on
//! the bus; storage workers and stream bridges consume them.

pub mod bus;

pub use bus::{
    DEFAULT_SUBSCRIBER_CAPACITY, Envelope, EventBus, PublishReport, Subscription, SubscriptionId,
};

use crate::domain::HarvestEvent;

/// Bus carrying harvested records.
pub type HarvestBus = EventBus<HarvestEvent>;
