//! Callback Dispatcher
//!
//! Events werden in eine Queue gestellt und von einem eigenen Thread an alle
//! registrierten Beobachter verteilt. Pro Event wird die Beobachterliste
//! einmal festgehalten, daher sehen alle Beobachter dieselbe Reihenfolge.
//! Ein entfernter Beobachter bekommt ein laufendes Event entweder ganz oder
//! gar nicht.

use super::events::RoomEvent;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Kapazität des Broadcast-Spiegels für async Konsumenten
const MIRROR_CAPACITY: usize = 1024;

/// Beobachter der Engine. Wird auf dem Dispatch-Thread aufgerufen.
pub trait RoomObserver: Send + Sync {
    fn on_event(&self, event: &RoomEvent);
}

enum Command {
    Event(RoomEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct ObserverSlot {
    observer: Arc<dyn RoomObserver>,
    active: AtomicBool,
    delivery: Mutex<()>,
}

impl ObserverSlot {
    fn is(&self, observer: &Arc<dyn RoomObserver>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.observer) as *const (),
            Arc::as_ptr(observer) as *const (),
        )
    }
}

type ObserverList = Arc<RwLock<Vec<Arc<ObserverSlot>>>>;

/// Sendeseite der Event-Queue. Blockiert nie.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventEmitter {
    pub fn emit(&self, event: RoomEvent) {
        if event.is_periodic() {
            tracing::trace!("Emitting {}", event.name());
        } else {
            tracing::debug!("Emitting {}", event.name());
        }
        if self.tx.send(Command::Event(event)).is_err() {
            tracing::trace!("Dispatcher stopped, event dropped");
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

pub struct CallbackDispatcher {
    emitter: EventEmitter,
    observers: ObserverList,
    mirror: broadcast::Sender<RoomEvent>,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (mirror, _) = broadcast::channel(MIRROR_CAPACITY);
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));

        let thread = {
            let observers = observers.clone();
            let mirror = mirror.clone();
            std::thread::Builder::new()
                .name("roomlink-dispatch".into())
                .spawn(move || Self::run(rx, observers, mirror))
        };
        let (thread, thread_id) = match thread {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                tracing::error!("Failed to spawn dispatch thread: {}", e);
                (None, None)
            }
        };

        Self {
            emitter: EventEmitter { tx },
            observers,
            mirror,
            thread,
            thread_id,
        }
    }

    fn run(
        mut rx: mpsc::UnboundedReceiver<Command>,
        observers: ObserverList,
        mirror: broadcast::Sender<RoomEvent>,
    ) {
        tracing::debug!("Dispatch thread started");
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Event(event) => {
                    let snapshot: Vec<Arc<ObserverSlot>> = observers.read().clone();
                    for slot in &snapshot {
                        let _delivery = slot.delivery.lock();
                        if !slot.active.load(Ordering::Acquire) {
                            continue;
                        }
                        let result =
                            catch_unwind(AssertUnwindSafe(|| slot.observer.on_event(&event)));
                        if result.is_err() {
                            tracing::error!("Observer panicked while handling {}", event.name());
                        }
                    }
                    let _ = mirror.send(event);
                }
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown => break,
            }
        }
        tracing::debug!("Dispatch thread stopped");
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn emit(&self, event: RoomEvent) {
        self.emitter.emit(event);
    }

    /// Registriert einen Beobachter. Doppelte Registrierung wirkt wie eine.
    pub fn add_observer(&self, observer: Arc<dyn RoomObserver>) {
        let mut observers = self.observers.write();
        if observers.iter().any(|slot| slot.is(&observer)) {
            return;
        }
        observers.push(Arc::new(ObserverSlot {
            observer,
            active: AtomicBool::new(true),
            delivery: Mutex::new(()),
        }));
    }

    /// Entfernt einen Beobachter. Außerhalb des Dispatch-Threads kehrt der
    /// Aufruf erst zurück, wenn eine laufende Zustellung an ihn beendet ist.
    pub fn remove_observer(&self, observer: &Arc<dyn RoomObserver>) {
        let removed = {
            let mut observers = self.observers.write();
            let index = observers.iter().position(|slot| slot.is(observer));
            index.map(|i| observers.remove(i))
        };
        let Some(slot) = removed else {
            return;
        };
        slot.active.store(false, Ordering::Release);
        if !self.on_dispatch_thread() {
            drop(slot.delivery.lock());
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Async Spiegel aller zugestellten Events
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.mirror.subscribe()
    }

    /// Wartet, bis alle bisher eingereihten Events zugestellt sind
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.emitter.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn on_dispatch_thread(&self) -> bool {
        self.thread_id == Some(std::thread::current().id())
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        let _ = self.emitter.tx.send(Command::Shutdown);
        if self.on_dispatch_thread() {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
    }

    impl RoomObserver for Counter {
        fn on_event(&self, _event: &RoomEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let dispatcher = CallbackDispatcher::new();
        let counter = Arc::new(Counter::default());
        let observer: Arc<dyn RoomObserver> = counter.clone();
        dispatcher.add_observer(observer.clone());
        dispatcher.add_observer(observer.clone());
        assert_eq!(dispatcher.observer_count(), 1);

        dispatcher.emit(RoomEvent::ConnectionLost);
        dispatcher.flush().await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_delivery_after_remove() {
        let dispatcher = CallbackDispatcher::new();
        let counter = Arc::new(Counter::default());
        let observer: Arc<dyn RoomObserver> = counter.clone();
        dispatcher.add_observer(observer.clone());
        dispatcher.remove_observer(&observer);
        dispatcher.emit(RoomEvent::ConnectionLost);
        dispatcher.flush().await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 0);
    }

    struct Panicking;

    impl RoomObserver for Panicking {
        fn on_event(&self, _event: &RoomEvent) {
            panic!("observer failure");
        }
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_dispatch() {
        let dispatcher = CallbackDispatcher::new();
        let counter = Arc::new(Counter::default());
        dispatcher.add_observer(Arc::new(Panicking));
        dispatcher.add_observer(counter.clone());

        dispatcher.emit(RoomEvent::ConnectionLost);
        dispatcher.emit(RoomEvent::ConnectionRecovery);
        dispatcher.flush().await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
    }

    struct Slow {
        started: AtomicBool,
        finished: AtomicBool,
    }

    impl RoomObserver for Slow {
        fn on_event(&self, _event: &RoomEvent) {
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_remove_waits_for_in_flight_delivery() {
        let dispatcher = CallbackDispatcher::new();
        let slow = Arc::new(Slow {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let observer: Arc<dyn RoomObserver> = slow.clone();
        dispatcher.add_observer(observer.clone());
        dispatcher.emit(RoomEvent::ConnectionLost);

        while !slow.started.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        dispatcher.remove_observer(&observer);
        // Vollständig zugestellt, nie halb
        assert!(slow.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_mirror_sees_events_in_order() {
        let dispatcher = CallbackDispatcher::new();
        let mut events = dispatcher.subscribe();
        dispatcher.emit(RoomEvent::ConnectionLost);
        dispatcher.emit(RoomEvent::ConnectionRecovery);
        assert_eq!(events.recv().await.unwrap(), RoomEvent::ConnectionLost);
        assert_eq!(events.recv().await.unwrap(), RoomEvent::ConnectionRecovery);
    }
}
