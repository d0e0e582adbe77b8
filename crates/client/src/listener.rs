//! Bus subscriptions with debounce, gating, one-shot and visibility pausing.
//!
//! ```rust,ignore
//! let _typing = Listener::<topics::TypingStatusChanged>::new(&bus)
//!     .debounce(TYPING_DEBOUNCE)
//!     .when(|t| t.recipient_id.as_deref() == Some(me))
//!     .pause_when_hidden(&visibility)
//!     .subscribe(|t| render_typing(t));
//! ```
//!
//! Events that arrive while paused are dropped, not buffered. Use
//! [`Listener::on_resume`] to refetch whatever the view needs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, Handler, HandlerId, Topic};
use crate::{log_debug, log_warn};

/// Debounce window for typing indicators.
pub const TYPING_DEBOUNCE: Duration = Duration::from_millis(100);
/// Debounce window for presence updates.
pub const PRESENCE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Whether the page (or window) showing the client is visible.
#[derive(Clone)]
pub struct PageVisibility {
    tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for PageVisibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageVisibility")
            .field("visible", &self.is_visible())
            .finish()
    }
}

impl Default for PageVisibility {
    fn default() -> Self {
        Self::new()
    }
}

impl PageVisibility {
    /// Starts visible.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
    }

    pub fn hide(&self) {
        self.set_visible(false);
    }

    pub fn show(&self) {
        self.set_visible(true);
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

type Predicate<T> = Arc<dyn Fn(&<T as Topic>::Payload) -> bool + Send + Sync>;

/// Builder for a bus subscription.
pub struct Listener<T: Topic> {
    bus: Arc<EventBus>,
    debounce: Option<Duration>,
    when: Option<Predicate<T>>,
    once: bool,
    visibility: Option<PageVisibility>,
    on_resume: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T> Listener<T>
where
    T: Topic,
    T::Payload: Clone,
{
    pub fn new(bus: &Arc<EventBus>) -> Self {
        Self {
            bus: bus.clone(),
            debounce: None,
            when: None,
            once: false,
            visibility: None,
            on_resume: None,
        }
    }

    /// Deliver only the last event of a burst, `window` after it arrived.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }

    /// Skip events for which `predicate` is false.
    pub fn when(mut self, predicate: impl Fn(&T::Payload) -> bool + Send + Sync + 'static) -> Self {
        self.when = Some(Arc::new(predicate));
        self
    }

    /// Unsubscribe after the first delivery.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Stop listening while `visibility` reports hidden.
    pub fn pause_when_hidden(mut self, visibility: &PageVisibility) -> Self {
        self.visibility = Some(visibility.clone());
        self
    }

    /// Run `callback` each time listening resumes after the page was hidden.
    pub fn on_resume(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_resume = Some(Arc::new(callback));
        self
    }

    /// Register `handler`. Listening stops when the returned handle is
    /// cancelled or dropped.
    pub fn subscribe(
        self,
        handler: impl Fn(&T::Payload) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let state = Arc::new_cyclic(|weak: &Weak<State<T>>| {
            let weak = weak.clone();
            let entry: Handler<T> = Arc::new(move |payload: &T::Payload| {
                if let Some(state) = weak.upgrade() {
                    state.on_event(payload);
                }
            });
            State {
                bus: Arc::downgrade(&self.bus),
                registration: Mutex::new(None),
                cancelled: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                handler: Arc::new(handler),
                when: self.when,
                once: self.once,
                debounce: self.debounce,
                entry,
                watcher: Mutex::new(None),
            }
        });

        match self.visibility {
            Some(visibility) => {
                let mut visible = visibility.watch();
                if *visible.borrow_and_update() {
                    state.attach();
                } else {
                    state.paused.store(true, Ordering::SeqCst);
                }
                match Handle::try_current() {
                    Ok(runtime) => {
                        let task = runtime.spawn(follow_visibility(
                            state.clone(),
                            visible,
                            self.on_resume,
                        ));
                        *state.watcher.lock() = Some(task);
                    }
                    Err(_) => log_warn!(
                        "'{}' listener: no tokio runtime, visibility changes are ignored",
                        T::NAME
                    ),
                }
            }
            None => state.attach(),
        }

        ListenerHandle { inner: state }
    }
}

struct State<T: Topic> {
    bus: Weak<EventBus>,
    registration: Mutex<Option<HandlerId>>,
    cancelled: AtomicBool,
    paused: AtomicBool,
    /// Bumped on every debounced event; a pending delivery only fires if
    /// no newer event arrived.
    generation: AtomicU64,
    handler: Arc<dyn Fn(&T::Payload) + Send + Sync>,
    when: Option<Predicate<T>>,
    once: bool,
    debounce: Option<Duration>,
    /// What is registered on the bus. Holds only a weak reference back.
    entry: Handler<T>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T> State<T>
where
    T: Topic,
    T::Payload: Clone,
{
    fn inactive(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst)
    }

    fn on_event(self: &Arc<Self>, payload: &T::Payload) {
        if self.inactive() {
            return;
        }
        if let Some(when) = &self.when {
            if !when(payload) {
                return;
            }
        }

        let Some(window) = self.debounce else {
            self.deliver(payload);
            return;
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match Handle::try_current() {
            Ok(runtime) => {
                let state = Arc::clone(self);
                let payload = payload.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(window).await;
                    if state.generation.load(Ordering::SeqCst) == generation {
                        state.deliver(&payload);
                    }
                });
            }
            Err(_) => {
                log_warn!("'{}' listener: no tokio runtime, delivering without debounce", T::NAME);
                self.deliver(payload);
            }
        }
    }

    fn deliver(&self, payload: &T::Payload) {
        if self.inactive() {
            return;
        }
        if self.once && self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.once {
            self.teardown();
        }
        (self.handler)(payload);
    }

    fn attach(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut registration = self.registration.lock();
        if registration.is_none() {
            *registration = Some(bus.on_shared::<T>(self.entry.clone()));
        }
    }

    fn detach(&self) {
        if let Some(id) = self.registration.lock().take() {
            if let Some(bus) = self.bus.upgrade() {
                bus.off::<T>(id);
            }
        }
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.detach();
    }

    /// Returns false if the listener was cancelled meanwhile.
    fn resume(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.attach();
        true
    }

    fn teardown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.detach();
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }
}

async fn follow_visibility<T>(
    state: Arc<State<T>>,
    mut visible: watch::Receiver<bool>,
    on_resume: Option<Arc<dyn Fn() + Send + Sync>>,
) where
    T: Topic,
    T::Payload: Clone,
{
    while visible.changed().await.is_ok() {
        let now_visible = *visible.borrow_and_update();
        if now_visible {
            if !state.resume() {
                break;
            }
            log_debug!("'{}' listener resumed", T::NAME);
            if let Some(callback) = &on_resume {
                callback();
            }
        } else {
            log_debug!("'{}' listener paused", T::NAME);
            state.pause();
        }
    }
}

trait Subscription: Send + Sync {
    fn cancel(&self);
    fn is_active(&self) -> bool;
}

impl<T> Subscription for State<T>
where
    T: Topic,
    T::Payload: Clone,
{
    fn cancel(&self) {
        self.teardown();
    }

    fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }
}

/// Keeps a listener alive. Dropping it unsubscribes.
pub struct ListenerHandle {
    inner: Arc<dyn Subscription>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

impl ListenerHandle {
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// False once cancelled, dropped from a one-shot delivery, or torn down.
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}
