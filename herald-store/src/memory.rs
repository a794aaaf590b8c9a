//! In-process store.
//!
//! A single lock around the keyspace plays the role of the real store's
//! single-threaded command loop: every trait call is one atomic operation.
//! Pub/sub fans out over unbounded channels, one per subscription.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::{Message, Store, Subscription};

enum Value {
  Str(String),
  Hash(HashMap<String, String>),
  Set(HashSet<String>),
}

struct Subscriber {
  channels: HashSet<String>,
  tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Inner {
  data: Mutex<HashMap<String, Value>>,
  subscribers: Mutex<HashMap<u64, Subscriber>>,
  next_subscriber: AtomicU64,
  offline: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
  fn check_online(&self) -> Result<()> {
    if self.offline.load(Ordering::Acquire) {
      return Err(StoreError::Connection("store unreachable".to_string()));
    }
    Ok(())
  }

  fn with_data<R>(&self, f: impl FnOnce(&mut HashMap<String, Value>) -> Result<R>) -> Result<R> {
    self.check_online()?;
    f(&mut lock(&self.data))
  }
}

/// Cloneable handle; all clones share one keyspace, like connections to one server.
#[derive(Clone, Default)]
pub struct MemoryStore {
  inner: Arc<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate losing (or regaining) the store. Going offline fails every
  /// operation and drops all live subscriptions.
  pub fn set_offline(&self, offline: bool) {
    self.inner.offline.store(offline, Ordering::Release);
    if offline {
      lock(&self.inner.subscribers).clear();
      debug!("memory store went offline");
    }
  }
}

fn hash_mut<'a>(
  data: &'a mut HashMap<String, Value>,
  key: &str,
) -> Result<&'a mut HashMap<String, String>> {
  match data
    .entry(key.to_string())
    .or_insert_with(|| Value::Hash(HashMap::new()))
  {
    Value::Hash(hash) => Ok(hash),
    _ => Err(StoreError::WrongType(key.to_string())),
  }
}

fn hash_ref<'a>(
  data: &'a HashMap<String, Value>,
  key: &str,
) -> Result<Option<&'a HashMap<String, String>>> {
  match data.get(key) {
    None => Ok(None),
    Some(Value::Hash(hash)) => Ok(Some(hash)),
    Some(_) => Err(StoreError::WrongType(key.to_string())),
  }
}

fn set_mut<'a>(data: &'a mut HashMap<String, Value>, key: &str) -> Result<&'a mut HashSet<String>> {
  match data
    .entry(key.to_string())
    .or_insert_with(|| Value::Set(HashSet::new()))
  {
    Value::Set(set) => Ok(set),
    _ => Err(StoreError::WrongType(key.to_string())),
  }
}

fn set_ref<'a>(data: &'a HashMap<String, Value>, key: &str) -> Result<Option<&'a HashSet<String>>> {
  match data.get(key) {
    None => Ok(None),
    Some(Value::Set(set)) => Ok(Some(set)),
    Some(_) => Err(StoreError::WrongType(key.to_string())),
  }
}

/// Empty hashes and sets disappear, as they do in the real store.
fn drop_if_empty(data: &mut HashMap<String, Value>, key: &str) {
  let empty = match data.get(key) {
    Some(Value::Hash(hash)) => hash.is_empty(),
    Some(Value::Set(set)) => set.is_empty(),
    _ => false,
  };
  if empty {
    data.remove(key);
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn ping(&self) -> Result<()> {
    self.inner.check_online()
  }

  async fn get(&self, key: &str) -> Result<Option<String>> {
    self.inner.with_data(|data| match data.get(key) {
      None => Ok(None),
      Some(Value::Str(value)) => Ok(Some(value.clone())),
      Some(_) => Err(StoreError::WrongType(key.to_string())),
    })
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    self.inner.with_data(|data| {
      data.insert(key.to_string(), Value::Str(value.to_string()));
      Ok(())
    })
  }

  async fn del(&self, key: &str) -> Result<bool> {
    self.inner.with_data(|data| Ok(data.remove(key).is_some()))
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    self
      .inner
      .with_data(|data| Ok(hash_ref(data, key)?.and_then(|hash| hash.get(field).cloned())))
  }

  async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
    self.inner.with_data(|data| {
      hash_mut(data, key)?.insert(field.to_string(), value.to_string());
      Ok(())
    })
  }

  async fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize> {
    self.inner.with_data(|data| {
      if hash_ref(data, key)?.is_none() {
        return Ok(0);
      }
      let hash = hash_mut(data, key)?;
      let removed = fields
        .iter()
        .filter(|field| hash.remove(**field).is_some())
        .count();
      drop_if_empty(data, key);
      Ok(removed)
    })
  }

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
    self
      .inner
      .with_data(|data| Ok(hash_ref(data, key)?.cloned().unwrap_or_default()))
  }

  async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
    self
      .inner
      .with_data(|data| Ok(set_mut(data, key)?.insert(member.to_string())))
  }

  async fn srem(&self, key: &str, member: &str) -> Result<bool> {
    self.inner.with_data(|data| {
      if set_ref(data, key)?.is_none() {
        return Ok(false);
      }
      let removed = set_mut(data, key)?.remove(member);
      drop_if_empty(data, key);
      Ok(removed)
    })
  }

  async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
    self
      .inner
      .with_data(|data| Ok(set_ref(data, key)?.cloned().unwrap_or_default()))
  }

  async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
    self
      .inner
      .with_data(|data| Ok(set_ref(data, key)?.is_some_and(|set| set.contains(member))))
  }

  async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
    self.inner.check_online()?;
    let subscribers = lock(&self.inner.subscribers);
    let delivered = subscribers
      .values()
      .filter(|sub| sub.channels.contains(channel))
      .filter(|sub| {
        sub
          .tx
          .send(Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
          })
          .is_ok()
      })
      .count();
    Ok(delivered)
  }

  async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
    self.inner.check_online()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
    lock(&self.inner.subscribers).insert(
      id,
      Subscriber {
        channels: channels.iter().cloned().collect(),
        tx,
      },
    );
    debug!(subscription = id, ?channels, "opened subscription");
    Ok(Box::new(MemorySubscription {
      id,
      inner: self.inner.clone(),
      rx,
    }))
  }
}

struct MemorySubscription {
  id: u64,
  inner: Arc<Inner>,
  rx: mpsc::UnboundedReceiver<Message>,
}

impl MemorySubscription {
  fn update(&self, f: impl FnOnce(&mut HashSet<String>)) -> Result<()> {
    self.inner.check_online()?;
    let mut subscribers = lock(&self.inner.subscribers);
    let subscriber = subscribers
      .get_mut(&self.id)
      .ok_or(StoreError::SubscriptionClosed)?;
    f(&mut subscriber.channels);
    Ok(())
  }
}

#[async_trait]
impl Subscription for MemorySubscription {
  async fn subscribe(&mut self, channels: &[String]) -> Result<()> {
    self.update(|subscribed| subscribed.extend(channels.iter().cloned()))
  }

  async fn unsubscribe(&mut self, channels: &[String]) -> Result<()> {
    self.update(|subscribed| {
      for channel in channels {
        subscribed.remove(channel);
      }
    })
  }

  async fn next_message(&mut self) -> Option<Message> {
    self.rx.recv().await
  }

  fn channels(&self) -> Vec<String> {
    let subscribers = lock(&self.inner.subscribers);
    let mut channels: Vec<String> = subscribers
      .get(&self.id)
      .map(|sub| sub.channels.iter().cloned().collect())
      .unwrap_or_default();
    channels.sort();
    channels
  }
}

impl Drop for MemorySubscription {
  fn drop(&mut self) {
    lock(&self.inner.subscribers).remove(&self.id);
  }
}
