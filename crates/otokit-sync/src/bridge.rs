//! Notification bridge.
//!
//! Holds at most one listener and delivers events to it in production
//! order. Every event goes through one unbounded queue drained by a single
//! dispatcher task; the listener is looked up at delivery time, so once a
//! new listener is registered the old one receives nothing further.

use std::sync::Arc;

use otokit_types::{EventSink, RunEvent, RunStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Consumer of run events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

impl<F> EventListener for F
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) {
        self(event)
    }
}

impl EventListener for mpsc::UnboundedSender<RunEvent> {
    fn on_event(&self, event: &RunEvent) {
        if self.send(event.clone()).is_err() {
            trace!(kind = event.kind(), "Listener channel closed");
        }
    }
}

type ListenerSlot = Arc<RwLock<Option<Arc<dyn EventListener>>>>;

enum Envelope {
    Event(RunEvent),
    Flush(oneshot::Sender<()>),
}

/// Single-listener, ordered event bridge.
///
/// Cheap to clone; clones share the queue, the listener slot and the status.
#[derive(Clone)]
pub struct NotificationBridge {
    tx: mpsc::UnboundedSender<Envelope>,
    listener: ListenerSlot,
    status: Arc<Mutex<RunStatus>>,
}

impl NotificationBridge {
    /// Create the bridge and spawn its dispatcher. Must be called inside a
    /// tokio runtime. The dispatcher exits when every clone is dropped.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: ListenerSlot = Arc::new(RwLock::new(None));
        tokio::spawn(dispatch(rx, Arc::clone(&listener)));
        Self {
            tx,
            listener,
            status: Arc::new(Mutex::new(RunStatus::default())),
        }
    }

    /// Register `listener`, replacing any previous one.
    pub fn set_listener(&self, listener: impl EventListener + 'static) {
        *self.listener.write() = Some(Arc::new(listener));
    }

    /// Remove the listener; events are dropped until a new one registers.
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    /// Latest status.
    pub fn status(&self) -> RunStatus {
        self.status.lock().clone()
    }

    /// Wait until everything enqueued so far has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// This bridge as a shared sink for producers.
    pub fn sink(&self) -> otokit_types::SharedEventSink {
        Arc::new(self.clone())
    }

    fn enqueue(&self, event: RunEvent) {
        if self.tx.send(Envelope::Event(event)).is_err() {
            trace!("Bridge dispatcher gone");
        }
    }
}

impl Default for NotificationBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for NotificationBridge {
    fn emit(&self, event: RunEvent) {
        let update = match &event {
            RunEvent::Status { status, is_running } => {
                Some(RunStatus::new(status.clone(), *is_running))
            }
            RunEvent::Finish { status, is_running } => {
                Some(RunStatus::new(Some(status.clone()), *is_running))
            }
            _ => None,
        };

        match update {
            // Status changes are applied and enqueued under one lock so the
            // queue order matches the order of status mutations.
            Some(next) => {
                let mut status = self.status.lock();
                *status = next;
                self.enqueue(event);
            }
            None => self.enqueue(event),
        }
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Envelope>, listener: ListenerSlot) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Event(event) => {
                let current = listener.read().clone();
                match current {
                    Some(listener) => listener.on_event(&event),
                    None => trace!(kind = event.kind(), "No listener, event dropped"),
                }
            }
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bridge = NotificationBridge::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.set_listener(tx);

        bridge.emit(RunEvent::start_auth("http://auth"));
        bridge.emit(RunEvent::progress("one"));
        bridge.emit(RunEvent::progress("two"));
        bridge.emit(RunEvent::finish());
        bridge.flush().await;

        let mut got = Vec::new();
        while let Ok(e) = rx.try_recv() {
            got.push(e);
        }
        assert_eq!(
            got,
            vec![
                RunEvent::start_auth("http://auth"),
                RunEvent::progress("one"),
                RunEvent::progress("two"),
                RunEvent::finish(),
            ]
        );
    }

    #[tokio::test]
    async fn test_status_tracked() {
        let bridge = NotificationBridge::new();
        bridge.set_status(Some("隧道已启动".to_string()), true);
        assert_eq!(bridge.status(), RunStatus::new(Some("隧道已启动".to_string()), true));

        bridge.emit(RunEvent::finish());
        let status = bridge.status();
        assert_eq!(status.status.as_deref(), Some(otokit_types::FINISH_STATUS));
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_closure_listener() {
        let bridge = NotificationBridge::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge.set_listener(move |e: &RunEvent| sink.lock().push(e.kind()));

        bridge.emit(RunEvent::error("boom"));
        bridge.flush().await;
        assert_eq!(*seen.lock(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_no_listener_drops_events() {
        let bridge = NotificationBridge::new();
        bridge.emit(RunEvent::progress("lost"));
        bridge.flush().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.set_listener(tx);
        bridge.flush().await;
        assert!(rx.try_recv().is_err());
    }
}
