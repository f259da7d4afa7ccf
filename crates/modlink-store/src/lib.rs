/*!
 * Modlink Store
 *
 * This crate provides the status store contract and its implementations
 * for the Modlink driver runtime: a Redis-backed client for production, an
 * in-memory store for tests, per-module status storage, and the
 * cluster-wide subscription registry.
 */

#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod redis;
pub mod storage;
pub mod store;
pub mod subscriptions;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use storage::Storage;
pub use store::{Store, StoreSubscriber, SubscriberEvent, NULL_VALUE};
pub use subscriptions::{
    Subscription, SubscriptionCallback, SubscriptionKind, Subscriptions, LOOKUP_CHANGE_CHANNEL,
};

/// Modlink store crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
