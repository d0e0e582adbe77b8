//! Typed, synchronous publish/subscribe bus.
//!
//! Socket frames and fallback deliveries are published here; UI-side
//! consumers subscribe through [`crate::listener::Listener`] or directly with
//! [`EventBus::on`]. Each topic is a marker type binding a wire name to one
//! payload type, so a handler can never receive the wrong shape.
//!
//! One bus is built per process and shared as `Arc<EventBus>` by every
//! coordinator, fallback sender and listener.
//!
//! Dispatch is synchronous and FIFO per topic. Emitting a topic nobody
//! listens to is a no-op.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chatwire_shared::{
    ChatMessage, ErrorFrame, ReadReceipt, StatusUpdate, TypingStatus, UnreadCounts,
};
use parking_lot::Mutex;

use crate::ws::ConnectionSnapshot;

/// A bus topic: a stable event name and the payload it carries.
pub trait Topic: 'static {
    const NAME: &'static str;
    type Payload: Send + Sync + 'static;
}

/// A registered handler for topic `T`.
pub type Handler<T> = Arc<dyn Fn(&<T as Topic>::Payload) + Send + Sync>;

/// Identifies one registration, returned by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    /// Always a `Handler<T>` for the topic this entry is filed under.
    handler: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<TypeId, Vec<Entry>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock();
        let total: usize = handlers.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("topics", &handlers.len())
            .field("handlers", &total)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for `T`.
    pub fn on<T: Topic>(&self, handler: impl Fn(&T::Payload) + Send + Sync + 'static) -> HandlerId {
        self.on_shared::<T>(Arc::new(handler))
    }

    /// Register an already shared handler. Used by listeners that detach and
    /// re-attach the same handler.
    pub fn on_shared<T: Topic>(&self, handler: Handler<T>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Entry {
                id,
                handler: Box::new(handler),
            });
        id
    }

    /// Remove a registration. Returns false if it was not registered.
    pub fn off<T: Topic>(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(entries) = handlers.get_mut(&TypeId::of::<T>()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(&TypeId::of::<T>());
        }
        removed
    }

    /// Publish `payload` to every handler of `T` registered right now, in
    /// registration order. Returns how many handlers ran.
    ///
    /// The registry lock is released before handlers run, so handlers may
    /// subscribe, unsubscribe or emit.
    pub fn emit<T: Topic>(&self, payload: &T::Payload) -> usize {
        let snapshot: Vec<Handler<T>> = {
            let handlers = self.handlers.lock();
            match handlers.get(&TypeId::of::<T>()) {
                Some(entries) => entries
                    .iter()
                    .filter_map(|entry| entry.handler.downcast_ref::<Handler<T>>().cloned())
                    .collect(),
                None => return 0,
            }
        };

        crate::log_debug!("bus: emitting '{}' to {} handler(s)", T::NAME, snapshot.len());
        for handler in &snapshot {
            handler(payload);
        }
        snapshot.len()
    }

    pub fn handler_count<T: Topic>(&self) -> usize {
        self.handlers
            .lock()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }
}

macro_rules! topics {
    ($($(#[$meta:meta])* $name:ident => $wire:literal : $payload:ty),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $name;

            impl Topic for $name {
                const NAME: &'static str = $wire;
                type Payload = $payload;
            }
        )*

        /// Every topic name this crate publishes.
        pub const TOPIC_NAMES: &[&str] = &[$($wire),*];
    };
}

/// Topic markers. Names are part of the public contract.
pub mod topics {
    use super::*;

    topics! {
        /// A message frame arrived on the messages channel.
        NewMessage => "new-message": ChatMessage,
        /// A message reached this client, from the socket or as the HTTP send response.
        MessageReceived => "message-received": ChatMessage,
        /// An outgoing message left the client.
        MessageSent => "message-sent": chatwire_shared::MessageSent,
        TypingStatusChanged => "typing-status-changed": TypingStatus,
        UserStatusChanged => "user-status-changed": StatusUpdate,
        MessagesRead => "messages-read": ReadReceipt,
        UnreadCountsUpdated => "unread-counts-updated": UnreadCounts,
        /// The HTTP fallback failed; the caller decides whether to retry.
        RetryFailedMessage => "retry-failed-message": chatwire_shared::RetryFailedMessage,
        /// The server sent an `error` frame.
        ServerError => "server-error": ErrorFrame,
        /// The coordinator's derived connection state changed.
        ConnectionStateChanged => "connection-state-changed": ConnectionSnapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::topics::*;
    use super::*;
    use chatwire_shared::Availability;

    fn status(user: &str) -> StatusUpdate {
        StatusUpdate {
            user_id: user.to_string(),
            status: Availability::Online,
            last_seen: None,
        }
    }

    #[test]
    fn emit_without_handlers_is_a_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.emit::<UserStatusChanged>(&status("u1")), 0);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = seen.clone();
            bus.on::<UserStatusChanged>(move |update| {
                seen.lock().push(format!("{n}:{}", update.user_id));
            });
        }

        assert_eq!(bus.emit::<UserStatusChanged>(&status("u1")), 3);
        assert_eq!(*seen.lock(), vec!["0:u1", "1:u1", "2:u1"]);
    }

    #[test]
    fn off_removes_only_that_registration() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c1 = count.clone();
        let first = bus.on::<UserStatusChanged>(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        bus.on::<UserStatusChanged>(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(bus.off::<UserStatusChanged>(first));
        assert!(!bus.off::<UserStatusChanged>(first));
        bus.emit::<UserStatusChanged>(&status("u1"));
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(bus.handler_count::<UserStatusChanged>(), 1);
    }

    #[test]
    fn topics_are_isolated_by_type() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        bus.on::<UnreadCountsUpdated>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit::<UserStatusChanged>(&status("u1"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.emit::<UnreadCountsUpdated>(&UnreadCounts::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = EventBus::new();
        let inner_hits = Arc::new(AtomicU64::new(0));

        let hits = inner_hits.clone();
        bus.on::<UnreadCountsUpdated>(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let bus_for_handler = bus.clone();
        bus.on::<UserStatusChanged>(move |_| {
            bus_for_handler.emit::<UnreadCountsUpdated>(&UnreadCounts::default());
            bus_for_handler.on::<UserStatusChanged>(|_| {});
        });

        bus.emit::<UserStatusChanged>(&status("u1"));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count::<UserStatusChanged>(), 2);
    }

    #[test]
    fn topic_names_are_unique() {
        let mut names = TOPIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), TOPIC_NAMES.len());
        assert!(TOPIC_NAMES.contains(&"retry-failed-message"));
    }
}
