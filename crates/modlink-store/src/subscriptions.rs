/*!
 * Cluster-wide status subscriptions.
 *
 * The registry tracks three kinds of subscription: direct (a module's
 * status key), indirect (a system role/index that resolves to a module
 * through the store and remaps when the platform rebinds roles), and
 * free-form named channels.
 *
 * A dedicated worker owns the subscribing connection. It listens on the
 * `lookup-change` channel for role rebinds, resubscribes everything when
 * the store connection recovers, and fans incoming messages out to the
 * registered callbacks. Both registry indices, the remap path, and the
 * resubscribe step are serialized under one mutex; the indirect resolve
 * is the only store round-trip performed while it is held.
 */
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use modlink_core::types::Id;
use modlink_core::utils::spawn_and_log;

use crate::error::Result;
use crate::store::{Store, StoreSubscriber, SubscriberEvent};

/// Channel carrying a system id whenever the platform rebinds module roles
pub const LOOKUP_CHANGE_CHANNEL: &str = "lookup-change";

/// Callback invoked with the subscription and the message payload
pub type SubscriptionCallback = Arc<dyn Fn(&Subscription, &str) + Send + Sync>;

/// What a subscription is bound to
#[derive(Debug, Clone)]
pub enum SubscriptionKind {
    /// A concrete module's status key
    Direct {
        /// The module
        module_id: Id,
        /// The status key
        status: String,
    },
    /// A system role/index that resolves to a module through the store
    Indirect {
        /// The system grouping
        system_id: Id,
        /// The module role within the system
        role: String,
        /// The index of the module filling the role
        index: u32,
        /// The status key
        status: String,
    },
    /// A free-form named channel with no module binding
    Channel {
        /// The literal channel name
        name: String,
    },
}

/// One registered subscription
pub struct Subscription {
    id: u64,
    kind: SubscriptionKind,
    channel: std::sync::Mutex<Option<String>>,
    callback: SubscriptionCallback,
}

impl Subscription {
    /// What this subscription is bound to
    pub fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    /// The store channel currently backing this subscription.
    ///
    /// `None` for an indirect subscription whose role has no module bound.
    pub fn channel(&self) -> Option<String> {
        self.channel.lock().expect("subscription lock poisoned").clone()
    }

    fn set_channel(&self, channel: Option<String>) {
        *self.channel.lock().expect("subscription lock poisoned") = channel;
    }

    fn fire(&self, message: &str) {
        let result = catch_unwind(AssertUnwindSafe(|| (self.callback)(self, message)));
        if result.is_err() {
            error!(
                "Subscription callback panicked on channel {:?}",
                self.channel()
            );
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("channel", &self.channel())
            .finish()
    }
}

#[derive(Debug)]
enum SubCmd {
    Subscribe(String),
    Unsubscribe(String),
    Terminate,
}

#[derive(Default)]
struct Registry {
    /// channel name -> subscriptions listening on it
    channels: HashMap<String, Vec<Arc<Subscription>>>,
    /// system id -> indirect subscriptions tracked for remapping
    systems: HashMap<String, Vec<Arc<Subscription>>>,
}

struct Inner {
    prefix: String,
    store: Arc<dyn Store>,
    registry: Mutex<Registry>,
    /// Unbounded so registry methods never block against the loop while
    /// holding the registry mutex
    commands: mpsc::UnboundedSender<SubCmd>,
    next_id: AtomicU64,
    terminated: AtomicBool,
}

/// The subscription registry and its subscribe-loop worker
#[derive(Clone)]
pub struct Subscriptions {
    inner: Arc<Inner>,
}

impl Subscriptions {
    /// Start the registry and its subscribe loop against `store`
    pub async fn start(prefix: &str, store: Arc<dyn Store>) -> Result<Self> {
        let subscriber = store.subscriber().await?;
        let (commands, command_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            prefix: prefix.to_string(),
            store,
            registry: Mutex::new(Registry::default()),
            commands,
            next_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
        });

        spawn_and_log(
            "subscribe-loop",
            run_subscribe_loop(inner.clone(), subscriber, command_rx),
        );

        Ok(Self { inner })
    }

    /// Subscribe to a concrete module's status key.
    ///
    /// If the store already holds a value, the callback fires with it
    /// immediately after registration.
    pub async fn subscribe_direct(
        &self,
        module_id: Id,
        status: &str,
        callback: SubscriptionCallback,
    ) -> Result<Arc<Subscription>> {
        let channel = format!("{}/{}/{}", self.inner.prefix, module_id, status);
        let hash_key = format!("{}/{}", self.inner.prefix, module_id);
        let sub = self.new_subscription(
            SubscriptionKind::Direct {
                module_id,
                status: status.to_string(),
            },
            Some(channel.clone()),
            callback,
        );

        {
            let mut registry = self.inner.registry.lock().await;
            self.register_channel(&mut registry, &channel, sub.clone());
        }

        if let Some(value) = self.inner.store.hget(&hash_key, status).await? {
            sub.fire(&value);
        }

        Ok(sub)
    }

    /// Subscribe to a system role/index's status key.
    ///
    /// The current module is resolved through the store; the subscription
    /// remaps automatically when a `lookup-change` event rebinds the role.
    pub async fn subscribe_indirect(
        &self,
        system_id: Id,
        role: &str,
        index: u32,
        status: &str,
        callback: SubscriptionCallback,
    ) -> Result<Arc<Subscription>> {
        let kind = SubscriptionKind::Indirect {
            system_id: system_id.clone(),
            role: role.to_string(),
            index,
            status: status.to_string(),
        };

        let (sub, resolved) = {
            // Resolve under the registry lock: the remap path must not
            // observe a half-registered indirect subscription.
            let mut registry = self.inner.registry.lock().await;
            let resolved = self.inner.resolve_indirect(&kind).await?;
            let channel = resolved.as_ref().map(|r| r.channel.clone());

            let sub = self.new_subscription(kind, channel.clone(), callback);
            registry
                .systems
                .entry(system_id.to_string())
                .or_default()
                .push(sub.clone());

            if let Some(channel) = channel {
                self.register_channel(&mut registry, &channel, sub.clone());
            }
            (sub, resolved)
        };
        if let Some(resolved) = resolved {
            if let Some(value) = self
                .inner
                .store
                .hget(&resolved.hash_key, &resolved.status)
                .await?
            {
                sub.fire(&value);
            }
        }

        Ok(sub)
    }

    /// Subscribe to a free-form named channel
    pub async fn channel(
        &self,
        name: &str,
        callback: SubscriptionCallback,
    ) -> Result<Arc<Subscription>> {
        let sub = self.new_subscription(
            SubscriptionKind::Channel {
                name: name.to_string(),
            },
            Some(name.to_string()),
            callback,
        );

        let mut registry = self.inner.registry.lock().await;
        self.register_channel(&mut registry, name, sub.clone());
        Ok(sub)
    }

    /// Remove a subscription from every index.
    ///
    /// The last subscriber leaving a channel unsubscribes it from the
    /// store.
    pub async fn unsubscribe(&self, sub: &Arc<Subscription>) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;

        if let Some(channel) = sub.channel() {
            if let Some(list) = registry.channels.get_mut(&channel) {
                list.retain(|s| s.id != sub.id);
                if list.is_empty() {
                    registry.channels.remove(&channel);
                    let _ = self.inner.commands.send(SubCmd::Unsubscribe(channel));
                }
            }
        }

        if let SubscriptionKind::Indirect { system_id, .. } = sub.kind() {
            let key = system_id.to_string();
            if let Some(list) = registry.systems.get_mut(&key) {
                list.retain(|s| s.id != sub.id);
                if list.is_empty() {
                    registry.systems.remove(&key);
                }
            }
        }

        Ok(())
    }

    /// Close the subscribe loop.
    ///
    /// Registered subscriptions stay in the registry but receive nothing
    /// further.
    pub async fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        let _ = self.inner.commands.send(SubCmd::Terminate);
    }

    /// Whether the registry has been terminated
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn new_subscription(
        &self,
        kind: SubscriptionKind,
        channel: Option<String>,
        callback: SubscriptionCallback,
    ) -> Arc<Subscription> {
        Arc::new(Subscription {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            kind,
            channel: std::sync::Mutex::new(channel),
            callback,
        })
    }

    fn register_channel(&self, registry: &mut Registry, channel: &str, sub: Arc<Subscription>) {
        let first = registry
            .channels
            .get(channel)
            .map_or(true, |list| list.is_empty());
        registry
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(sub);
        if first {
            let _ = self
                .inner
                .commands
                .send(SubCmd::Subscribe(channel.to_string()));
        }
    }
}

/// A resolved indirect binding
struct ResolvedIndirect {
    hash_key: String,
    channel: String,
    status: String,
}

impl Inner {
    /// Resolve the module currently filling an indirect subscription's
    /// role. Returns `None` when the role has no module bound.
    async fn resolve_indirect(&self, kind: &SubscriptionKind) -> Result<Option<ResolvedIndirect>> {
        let SubscriptionKind::Indirect {
            system_id,
            role,
            index,
            status,
        } = kind
        else {
            return Ok(None);
        };

        let lookup_key = format!("{}/{}/{}/{}", self.prefix, system_id, role, index);
        let Some(module_id) = self.store.get(&lookup_key).await? else {
            return Ok(None);
        };

        let hash_key = format!("{}/{}", self.prefix, module_id);
        Ok(Some(ResolvedIndirect {
            channel: format!("{}/{}", hash_key, status),
            hash_key,
            status: status.clone(),
        }))
    }

    /// Fan a message out to every subscriber of `channel`
    async fn dispatch(&self, subscriber: &mut dyn StoreSubscriber, channel: &str, payload: &str) {
        if channel == LOOKUP_CHANGE_CHANNEL {
            let mut registry = self.registry.lock().await;
            self.remap_locked(&mut registry, subscriber, payload).await;
            return;
        }

        let subs = {
            let registry = self.registry.lock().await;
            registry.channels.get(channel).cloned().unwrap_or_default()
        };

        if subs.is_empty() {
            // Benign race: the unsubscribe may still be in flight
            warn!("Message on channel {} with no subscribers", channel);
            return;
        }

        for sub in subs {
            sub.fire(payload);
        }
    }

    /// Re-resolve every indirect subscription under `system_id`, moving
    /// any whose channel changed. Runs with the registry lock held.
    async fn remap_locked(
        &self,
        registry: &mut Registry,
        subscriber: &mut dyn StoreSubscriber,
        system_id: &str,
    ) {
        let subs = registry.systems.get(system_id).cloned().unwrap_or_default();
        debug!(
            "Remapping {} indirect subscription(s) under system {}",
            subs.len(),
            system_id
        );

        for sub in subs {
            let resolved = match self.resolve_indirect(sub.kind()).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("Indirect re-resolution failed for {:?}: {}", sub, e);
                    continue;
                }
            };
            let new_channel = resolved.as_ref().map(|r| r.channel.clone());
            let old_channel = sub.channel();
            if new_channel == old_channel {
                continue;
            }

            if let Some(old) = old_channel {
                if let Some(list) = registry.channels.get_mut(&old) {
                    list.retain(|s| s.id != sub.id);
                    if list.is_empty() {
                        registry.channels.remove(&old);
                        if let Err(e) = subscriber.unsubscribe(&old).await {
                            warn!("Unsubscribe from {} failed: {}", old, e);
                        }
                    }
                }
            }

            sub.set_channel(new_channel);

            if let Some(resolved) = resolved {
                let first = registry
                    .channels
                    .get(&resolved.channel)
                    .map_or(true, |list| list.is_empty());
                registry
                    .channels
                    .entry(resolved.channel.clone())
                    .or_default()
                    .push(sub.clone());
                if first {
                    if let Err(e) = subscriber.subscribe(&resolved.channel).await {
                        warn!("Subscribe to {} failed: {}", resolved.channel, e);
                    }
                }

                // Deliver the rebound module's current value once
                match self.store.hget(&resolved.hash_key, &resolved.status).await {
                    Ok(Some(value)) => sub.fire(&value),
                    Ok(None) => {}
                    Err(e) => warn!("Initial read after remap failed: {}", e),
                }
            }
        }
    }

    /// Re-subscribe everything after the store connection recovered.
    /// Serialized with the remap path under the registry lock.
    async fn handle_reconnect(&self, subscriber: &mut dyn StoreSubscriber) {
        debug!("Store subscriber reconnected; replaying subscriptions");
        let mut registry = self.registry.lock().await;

        if let Err(e) = subscriber.subscribe(LOOKUP_CHANGE_CHANNEL).await {
            warn!("Resubscribe to {} failed: {}", LOOKUP_CHANGE_CHANNEL, e);
        }
        let channels: Vec<String> = registry.channels.keys().cloned().collect();
        for channel in channels {
            if let Err(e) = subscriber.subscribe(&channel).await {
                warn!("Resubscribe to {} failed: {}", channel, e);
            }
        }

        let systems: Vec<String> = registry.systems.keys().cloned().collect();
        for system_id in systems {
            self.remap_locked(&mut registry, subscriber, &system_id).await;
        }
    }
}

async fn run_subscribe_loop(
    inner: Arc<Inner>,
    mut subscriber: Box<dyn StoreSubscriber>,
    mut commands: mpsc::UnboundedReceiver<SubCmd>,
) -> Result<()> {
    if let Err(e) = subscriber.subscribe(LOOKUP_CHANGE_CHANNEL).await {
        warn!("Initial subscribe to {} failed: {}", LOOKUP_CHANGE_CHANNEL, e);
    }

    loop {
        let mut pending_cmd = None;
        let mut pending_event = None;

        tokio::select! {
            // Commands first: a pending SUBSCRIBE must take effect before
            // messages already queued behind it are considered
            biased;
            cmd = commands.recv() => match cmd {
                Some(cmd) => pending_cmd = Some(cmd),
                None => break,
            },
            event = subscriber.next_event() => match event {
                Some(event) => pending_event = Some(event),
                None => break,
            },
        }

        if let Some(cmd) = pending_cmd {
            match cmd {
                SubCmd::Subscribe(channel) => {
                    if let Err(e) = subscriber.subscribe(&channel).await {
                        warn!("Subscribe to {} failed: {}", channel, e);
                    }
                }
                SubCmd::Unsubscribe(channel) => {
                    if let Err(e) = subscriber.unsubscribe(&channel).await {
                        warn!("Unsubscribe from {} failed: {}", channel, e);
                    }
                }
                SubCmd::Terminate => {
                    if let Err(e) = subscriber.unsubscribe_all().await {
                        warn!("Unsubscribe-all failed: {}", e);
                    }
                    break;
                }
            }
        }

        if let Some(event) = pending_event {
            match event {
                SubscriberEvent::Message { channel, payload } => {
                    inner.dispatch(&mut *subscriber, &channel, &payload).await;
                }
                SubscriberEvent::Reconnected => {
                    inner.handle_reconnect(&mut *subscriber).await;
                }
                SubscriberEvent::Closed => break,
            }
        }
    }

    debug!("Subscribe loop exited");
    Ok(())
}
