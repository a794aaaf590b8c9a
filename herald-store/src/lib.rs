//! Shared key-value + publish/subscribe store used by every proxy in a fleet.
//!
//! The wire protocol of the real store is not modelled here. Proxies talk to
//! it through the [`Store`] trait, which covers the handful of string, hash,
//! set and pub/sub operations the presence protocol needs. [`MemoryStore`]
//! implements it in-process for tests and single-node deployments.

mod error;
pub mod keys;
mod memory;
mod models;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::{LastOnline, PlayerName, PlayerRecord, TranslationEntry};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  pub channel: String,
  pub payload: String,
}

/// Client handle for the shared store.
///
/// Every method is a single atomic store operation. Implementations own their
/// connection handling: a connection is taken for the duration of one call and
/// a connection that errored is discarded rather than reused.
#[async_trait]
pub trait Store: Send + Sync {
  /// Round-trip to verify the store is reachable.
  async fn ping(&self) -> Result<()>;

  async fn get(&self, key: &str) -> Result<Option<String>>;
  async fn set(&self, key: &str, value: &str) -> Result<()>;
  /// Returns whether the key existed.
  async fn del(&self, key: &str) -> Result<bool>;

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
  async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
  /// Returns how many of the fields existed.
  async fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize>;
  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

  /// Returns whether the member was newly added.
  async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
  /// Returns whether the member was present.
  async fn srem(&self, key: &str, member: &str) -> Result<bool>;
  async fn smembers(&self, key: &str) -> Result<HashSet<String>>;
  async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

  /// Publish to a channel, returning how many subscribers received it.
  async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

  /// Open a dedicated subscription on its own connection.
  async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>>;
}

/// A live subscription. Channels can be added or removed without tearing the
/// subscription down.
#[async_trait]
pub trait Subscription: Send {
  async fn subscribe(&mut self, channels: &[String]) -> Result<()>;
  async fn unsubscribe(&mut self, channels: &[String]) -> Result<()>;

  /// Wait for the next message. `None` means the subscription was lost.
  async fn next_message(&mut self) -> Option<Message>;

  /// Channels currently subscribed, sorted.
  fn channels(&self) -> Vec<String>;
}
