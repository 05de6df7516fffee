//! Outbound delivery.

pub mod delivery;

pub use delivery::{DeliveryAdapter, LogDelivery, MemoryDelivery, ReplySpec};
