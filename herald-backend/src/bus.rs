//! Cross-proxy command and event bus over the store's pub/sub.
//!
//! One long-lived subscription carries this proxy's unicast channel, the
//! fleet broadcast channel, the firehose and any application channels. The
//! listener only receives; each message is handled on its own task, bounded
//! by a semaphore, so a slow command never holds up delivery.
//!
//! If the store drops the subscription the listener reopens it with
//! backoff, restoring every application channel that was registered.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use herald_store::{Message, Store, StoreError, Subscription};
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{PresenceError, Result};
use crate::events::{FirehoseEvent, NetworkEvent};
use crate::host::{NetworkCommandSender, ProxyHost};
use crate::membership::Membership;
use crate::validation::{validate_channel_name, validate_command, validate_proxy_id};

/// Target name that addresses every proxy.
pub const ALL_SERVERS: &str = "allservers";

const EVENT_BUFFER: usize = 256;
const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Names of the channels the bus owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    prefix: String,
    proxy_id: String,
}

impl Channels {
    pub fn new(prefix: impl Into<String>, proxy_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            proxy_id: proxy_id.into(),
        }
    }

    pub fn unicast(&self) -> String {
        self.unicast_for(&self.proxy_id)
    }

    pub fn unicast_for(&self, proxy_id: &str) -> String {
        format!("{}-{}", self.prefix, proxy_id)
    }

    pub fn broadcast(&self) -> String {
        self.unicast_for(ALL_SERVERS)
    }

    pub fn firehose(&self) -> String {
        format!("{}-firehose", self.prefix)
    }

    /// Channels subscribed for the lifetime of the bus.
    pub fn reserved(&self) -> Vec<String> {
        vec![self.unicast(), self.broadcast(), self.firehose()]
    }
}

/// Changes to the live subscription, applied by the listener task.
enum ChannelRequest {
    Add(String, oneshot::Sender<Result<()>>),
    Remove(String, oneshot::Sender<Result<()>>),
}

enum Next {
    Request(ChannelRequest),
    Message(Option<Message>),
}

pub struct Bus {
    channels: Channels,
    store: Arc<dyn Store>,
    membership: Arc<Membership>,
    host: Arc<dyn ProxyHost>,
    events: broadcast::Sender<NetworkEvent>,
    requests: mpsc::Sender<ChannelRequest>,
    workers: Arc<Semaphore>,
    listening: AtomicBool,
}

/// The receiving half of the bus, consumed by [`Bus::run`].
pub struct BusListener {
    subscription: Box<dyn Subscription>,
    requests: mpsc::Receiver<ChannelRequest>,
}

impl Bus {
    /// Subscribe to the bus channels. The returned listener must be handed
    /// to [`Bus::run`] for anything to be delivered.
    pub async fn open(
        channels: Channels,
        store: Arc<dyn Store>,
        membership: Arc<Membership>,
        host: Arc<dyn ProxyHost>,
        workers: usize,
    ) -> Result<(Arc<Self>, BusListener)> {
        let subscription = store.subscribe(&channels.reserved()).await?;
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let bus = Arc::new(Self {
            channels,
            store,
            membership,
            host,
            events,
            requests: requests_tx,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            listening: AtomicBool::new(true),
        });
        let listener = BusListener {
            subscription,
            requests: requests_rx,
        };
        Ok((bus, listener))
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Whether the listener currently holds a live subscription. False while
    /// it is reopening one and after it stops.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Receive until cancelled. A lost subscription is reopened with
    /// backoff. Handlers are spawned on `tracker` so shutdown can wait for
    /// them.
    pub async fn run(
        self: Arc<Self>,
        listener: BusListener,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let BusListener {
            mut subscription,
            mut requests,
        } = listener;
        let mut application = BTreeSet::new();
        info!(channels = ?subscription.channels(), "bus listening");

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                Some(request) = requests.recv() => Next::Request(request),
                message = subscription.next_message() => Next::Message(message),
            };

            match next {
                Next::Request(request) => {
                    apply(subscription.as_mut(), &mut application, request).await
                }
                Next::Message(Some(message)) => {
                    let bus = self.clone();
                    tracker.spawn(async move {
                        let Ok(_permit) = bus.workers.clone().acquire_owned().await else {
                            return;
                        };
                        bus.handle(message).await;
                    });
                }
                Next::Message(None) => {
                    self.listening.store(false, Ordering::Release);
                    error!("bus subscription lost, reopening");
                    match self.resubscribe(&application, &mut requests, &cancel).await {
                        Some(reopened) => {
                            subscription = reopened;
                            self.listening.store(true, Ordering::Release);
                        }
                        None => {
                            info!("bus listener stopped while reopening");
                            return;
                        }
                    }
                }
            }
        }

        self.listening.store(false, Ordering::Release);
        let channels = subscription.channels();
        if let Err(err) = subscription.unsubscribe(&channels).await {
            warn!(%err, "failed to unsubscribe on shutdown");
        }
        info!("bus listener stopped");
    }

    /// Reopen the subscription on the bus channels plus `application`,
    /// doubling the delay after each failure. Channel requests made in the
    /// meantime are refused. Returns `None` if cancelled first.
    async fn resubscribe(
        &self,
        application: &BTreeSet<String>,
        requests: &mut mpsc::Receiver<ChannelRequest>,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn Subscription>> {
        let mut channels = self.channels.reserved();
        channels.extend(application.iter().cloned());
        let mut delay = RESUBSCRIBE_MIN_DELAY;

        loop {
            match self.store.subscribe(&channels).await {
                Ok(subscription) => {
                    info!(?channels, "bus subscription reopened");
                    return Some(subscription);
                }
                Err(err) => warn!(%err, retry_in = ?delay, "failed to reopen bus subscription"),
            }

            let backoff = tokio::time::sleep(delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = &mut backoff => break,
                    Some(request) = requests.recv() => refuse(request),
                }
            }
            delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
        }
    }

    async fn handle(&self, message: Message) {
        if message.channel == self.channels.firehose() {
            self.handle_firehose(&message.payload);
        } else {
            self.handle_command(message).await;
        }
    }

    fn handle_firehose(&self, payload: &str) {
        let event = match FirehoseEvent::decode(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, payload, "ignoring malformed firehose message");
                return;
            }
        };

        let event = match event {
            FirehoseEvent::Login { uuid } => NetworkEvent::PlayerJoinedNetwork { player: uuid },
            FirehoseEvent::Logoff { uuid } => NetworkEvent::PlayerLeftNetwork { player: uuid },
            FirehoseEvent::Server { uuid, server } => {
                if !self.host.has_server(&server) {
                    debug!(player = %uuid, %server, "dropping server change to unknown server");
                    return;
                }
                NetworkEvent::PlayerChangedServer {
                    player: uuid,
                    server,
                }
            }
        };
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn handle_command(&self, message: Message) {
        let _ = self.events.send(NetworkEvent::PubSubMessage {
            channel: message.channel.clone(),
            message: message.payload.clone(),
        });

        let trimmed = message.payload.trim();
        let command = trimmed.strip_prefix('/').unwrap_or(trimmed).to_string();
        if command.is_empty() {
            return;
        }

        let host = self.host.clone();
        let line = command.clone();
        let dispatched = tokio::task::spawn_blocking(move || {
            host.dispatch_command(&NetworkCommandSender, &line)
        })
        .await;

        match dispatched {
            Ok(true) => debug!(channel = %message.channel, %command, "dispatched network command"),
            Ok(false) => warn!(channel = %message.channel, %command, "host did not recognise command"),
            Err(err) => error!(%err, %command, "command handler panicked"),
        }
    }

    /// Publish a command to one proxy or, with [`ALL_SERVERS`], to every
    /// proxy. Returns how many subscribers received it.
    pub async fn send_proxy_command(&self, target: &str, command: &str) -> Result<usize> {
        validate_command(command)?;

        let channel = if target == ALL_SERVERS {
            self.channels.broadcast()
        } else {
            validate_proxy_id(target)?;
            if !self.membership.is_live(target).await {
                return Err(PresenceError::UnknownProxy(target.to_string()));
            }
            self.channels.unicast_for(target)
        };

        let delivered = self.store.publish(&channel, command).await?;
        debug!(%channel, command, delivered, "sent proxy command");
        Ok(delivered)
    }

    pub async fn add_channel(&self, channel: &str) -> Result<()> {
        validate_channel_name(channel, &self.reserved_channels().await)?;
        let (ack, done) = oneshot::channel();
        self.request(ChannelRequest::Add(channel.to_string(), ack), done)
            .await
    }

    pub async fn remove_channel(&self, channel: &str) -> Result<()> {
        validate_channel_name(channel, &self.reserved_channels().await)?;
        let (ack, done) = oneshot::channel();
        self.request(ChannelRequest::Remove(channel.to_string(), ack), done)
            .await
    }

    /// Bus channels plus the unicast channel of every live proxy.
    async fn reserved_channels(&self) -> Vec<String> {
        let mut reserved = self.channels.reserved();
        reserved.extend(
            self.membership
                .live_proxies()
                .await
                .iter()
                .map(|proxy| self.channels.unicast_for(proxy)),
        );
        reserved
    }

    async fn request(
        &self,
        request: ChannelRequest,
        done: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| StoreError::SubscriptionClosed)?;
        done.await.map_err(|_| StoreError::SubscriptionClosed)?
    }
}

/// Apply a channel change to the live subscription and keep `application`
/// in step so a reopened subscription gets the same channels.
async fn apply(
    subscription: &mut dyn Subscription,
    application: &mut BTreeSet<String>,
    request: ChannelRequest,
) {
    let (result, ack) = match request {
        ChannelRequest::Add(channel, ack) => {
            let result = subscription.subscribe(std::slice::from_ref(&channel)).await;
            info!(%channel, ok = result.is_ok(), "added application channel");
            if result.is_ok() {
                application.insert(channel);
            }
            (result, ack)
        }
        ChannelRequest::Remove(channel, ack) => {
            let result = subscription
                .unsubscribe(std::slice::from_ref(&channel))
                .await;
            info!(%channel, ok = result.is_ok(), "removed application channel");
            if result.is_ok() {
                application.remove(&channel);
            }
            (result, ack)
        }
    };
    let _ = ack.send(result.map_err(PresenceError::from));
}

fn refuse(request: ChannelRequest) {
    let (ChannelRequest::Add(channel, ack) | ChannelRequest::Remove(channel, ack)) = request;
    warn!(%channel, "refusing channel change while the bus reconnects");
    let _ = ack.send(Err(PresenceError::Store(StoreError::Connection(
        "bus subscription is reconnecting".to_string(),
    ))));
}
