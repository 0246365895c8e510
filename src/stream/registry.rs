//! Listener registry and dispatch.
//!
//! Every listener call goes through [`invoke_isolated`], which absorbs both
//! returned errors and panics. Nothing raised by a listener reaches the
//! connection worker or the other listeners for the same message.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};

use crate::stream::proto::{Envelope, InboundFrame, Topic, ALL_TOPIC};

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type ListenerFn = dyn Fn(&Envelope) -> Result<(), ListenerError> + Send + Sync;

/// Shared handle to a registered callback.
///
/// Identity is the underlying allocation: clones of one `Listener` are the
/// same listener, two `Listener::new` calls on equal closures are not.
#[derive(Clone)]
pub struct Listener {
    callback: Arc<ListenerFn>,
}

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        Self::fallible(move |envelope| {
            callback(envelope);
            Ok(())
        })
    }

    /// Wraps a callback whose errors should be logged by the dispatcher.
    pub fn fallible<F>(callback: F) -> Self
    where
        F: Fn(&Envelope) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Wraps a handler for a typed topic; the payload is decoded before the
    /// handler runs and a shape mismatch is reported as a listener error.
    pub fn typed<T, F>(handler: F) -> Self
    where
        T: Topic + 'static,
        F: Fn(T::Payload) + Send + Sync + 'static,
    {
        Self::fallible(move |envelope| {
            let payload = envelope.payload::<T::Payload>()?;
            handler(payload);
            Ok(())
        })
    }

    fn call(&self, envelope: &Envelope) -> Result<(), ListenerError> {
        (self.callback)(envelope)
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.callback) as *const ()
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address())
            .finish()
    }
}

/// Topic to listener-set mapping.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    topics: HashMap<String, Vec<Listener>>,
}

impl ListenerRegistry {
    /// Adds `listener` under `topic`; returns false when it was already there.
    pub fn insert(&mut self, topic: &str, listener: Listener) -> bool {
        let listeners = self.topics.entry(topic.to_string()).or_default();
        if listeners.contains(&listener) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes `listener` from `topic`; returns false when it was not there.
    pub fn remove(&mut self, topic: &str, listener: &Listener) -> bool {
        let Some(listeners) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|existing| existing != listener);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    pub fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Listeners for a message of type `kind`: the literal topic first, then
    /// the wildcard.
    pub fn listeners_for(&self, kind: &str) -> Vec<Listener> {
        let literal = self.topics.get(kind).into_iter().flatten();
        let wildcard = (kind != ALL_TOPIC)
            .then(|| self.topics.get(ALL_TOPIC))
            .flatten()
            .into_iter()
            .flatten();
        literal.chain(wildcard).cloned().collect()
    }
}

pub(crate) type SharedRegistry = Arc<RwLock<ListenerRegistry>>;

/// Counts from one dispatch round.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// What happened to one inbound text frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameOutcome {
    Liveness,
    Malformed,
    Dispatched(DispatchReport),
}

/// Runs one listener inside the failure boundary.
///
/// Returns false when the listener returned an error or panicked; both are
/// logged here and nowhere else.
pub fn invoke_isolated(listener: &Listener, envelope: &Envelope) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.call(envelope))) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(
                event = "listener_failed",
                topic = %envelope.kind,
                error = %err
            );
            false
        }
        Err(panic) => {
            error!(
                event = "listener_panicked",
                topic = %envelope.kind,
                reason = panic_message(panic.as_ref())
            );
            false
        }
    }
}

/// Delivers `envelope` to every matching listener.
///
/// The registry lock is released before any listener runs, so listeners may
/// register or unregister from inside a callback.
pub fn dispatch(registry: &RwLock<ListenerRegistry>, envelope: &Envelope) -> DispatchReport {
    let listeners = registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .listeners_for(&envelope.kind);

    let mut report = DispatchReport::default();
    for listener in &listeners {
        if invoke_isolated(listener, envelope) {
            report.delivered += 1;
        } else {
            report.failed += 1;
        }
    }
    report
}

/// Filters liveness literals, decodes, and dispatches one text frame.
pub fn route_frame(registry: &RwLock<ListenerRegistry>, text: &str) -> FrameOutcome {
    match InboundFrame::from_text(text) {
        Ok(InboundFrame::Liveness) => {
            debug!(event = "liveness_frame", payload = text);
            FrameOutcome::Liveness
        }
        Ok(InboundFrame::Event(envelope)) => {
            FrameOutcome::Dispatched(dispatch(registry, &envelope))
        }
        Err(err) => {
            warn!(
                event = "frame_decode_failed",
                error = %err,
                len = text.len()
            );
            FrameOutcome::Malformed
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, RwLock};

    use serde_json::json;

    use super::*;
    use crate::stream::proto::{KillSwitchTopic, LogEntry};

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        Listener::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn registry() -> RwLock<ListenerRegistry> {
        RwLock::new(ListenerRegistry::default())
    }

    #[test]
    fn duplicate_registration_delivers_once() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let listener = counting_listener(&calls);

        {
            let mut guard = registry.write().expect("lock");
            assert!(guard.insert("bot_alert", listener.clone()));
            assert!(!guard.insert("bot_alert", listener.clone()));
            assert_eq!(guard.count("bot_alert"), 1);
        }

        let report = dispatch(&registry, &Envelope::new("bot_alert", json!({})));
        assert_eq!(report.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn separately_built_listeners_are_distinct() {
        let mut registry = ListenerRegistry::default();
        assert!(registry.insert("log", Listener::new(|_| {})));
        assert!(registry.insert("log", Listener::new(|_| {})));
        assert_eq!(registry.count("log"), 2);
    }

    #[test]
    fn wildcard_receives_everything_literal_only_its_topic() {
        let registry = registry();
        let wildcard_calls = Arc::new(AtomicUsize::new(0));
        let x_calls = Arc::new(AtomicUsize::new(0));
        {
            let mut guard = registry.write().expect("lock");
            guard.insert(ALL_TOPIC, counting_listener(&wildcard_calls));
            guard.insert("X", counting_listener(&x_calls));
        }

        dispatch(&registry, &Envelope::new("X", json!(1)));
        dispatch(&registry, &Envelope::new("Y", json!(2)));
        dispatch(&registry, &Envelope::new("log", json!(3)));

        assert_eq!(wildcard_calls.load(Ordering::SeqCst), 3);
        assert_eq!(x_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn message_typed_all_is_not_delivered_twice_to_wildcard() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .write()
            .expect("lock")
            .insert(ALL_TOPIC, counting_listener(&calls));

        dispatch(&registry, &Envelope::new(ALL_TOPIC, json!(null)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let mut guard = registry.write().expect("lock");
            guard.insert("bot_alert", Listener::new(|_| panic!("listener bug")));
            guard.insert("bot_alert", counting_listener(&calls));
            guard.insert(ALL_TOPIC, Listener::new(|_| panic!("wildcard bug")));
            guard.insert(ALL_TOPIC, counting_listener(&calls));
        }

        let report = dispatch(&registry, &Envelope::new("bot_alert", json!({})));
        assert_eq!(report, DispatchReport { delivered: 2, failed: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_listener_is_counted_not_propagated() {
        let registry = registry();
        registry.write().expect("lock").insert(
            "log",
            Listener::fallible(|_| Err("disk full".into())),
        );

        let report = dispatch(&registry, &Envelope::new("log", json!({})));
        assert_eq!(report, DispatchReport { delivered: 0, failed: 1 });
    }

    #[test]
    fn off_removes_only_that_listener() {
        let registry = registry();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let first = counting_listener(&first_calls);
        let second = counting_listener(&second_calls);
        {
            let mut guard = registry.write().expect("lock");
            guard.insert("kill_switch", first.clone());
            guard.insert("kill_switch", second);
            assert!(guard.remove("kill_switch", &first));
            assert!(!guard.remove("kill_switch", &first));
            assert!(!guard.remove("never_registered", &first));
        }

        dispatch(&registry, &Envelope::new("kill_switch", json!({})));
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unregister_itself_during_dispatch() {
        let registry = Arc::new(registry());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let listener = {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            Listener::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().expect("slot").take() {
                    registry.write().expect("lock").remove("log", &me);
                }
            })
        };
        *slot.lock().expect("slot") = Some(listener.clone());
        registry.write().expect("lock").insert("log", listener);

        dispatch(&registry, &Envelope::new("log", json!({})));
        dispatch(&registry, &Envelope::new("log", json!({})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn liveness_frames_never_reach_listeners() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .write()
            .expect("lock")
            .insert(ALL_TOPIC, counting_listener(&calls));

        assert_eq!(route_frame(&registry, "ping"), FrameOutcome::Liveness);
        assert_eq!(route_frame(&registry, "pong"), FrameOutcome::Liveness);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .write()
            .expect("lock")
            .insert(ALL_TOPIC, counting_listener(&calls));

        assert_eq!(route_frame(&registry, "{\"type\":"), FrameOutcome::Malformed);
        assert_eq!(route_frame(&registry, "hello"), FrameOutcome::Malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let outcome = route_frame(&registry, r#"{"type":"log","data":{"message":"ok"}}"#);
        assert_eq!(
            outcome,
            FrameOutcome::Dispatched(DispatchReport { delivered: 1, failed: 0 })
        );
    }

    #[test]
    fn typed_listener_receives_decoded_payload() {
        let registry = registry();
        let seen: Arc<Mutex<Vec<LogEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = Arc::clone(&seen);
            Listener::typed::<KillSwitchTopic, _>(move |entry| {
                seen.lock().expect("seen").push(entry);
            })
        };
        registry
            .write()
            .expect("lock")
            .insert(KillSwitchTopic::NAME, listener);

        let ok = route_frame(
            &registry,
            r#"{"type":"kill_switch","priority":"critical","data":{"id":3,"message":"KILL-SWITCH armed"}}"#,
        );
        assert_eq!(
            ok,
            FrameOutcome::Dispatched(DispatchReport { delivered: 1, failed: 0 })
        );

        let bad = route_frame(&registry, r#"{"type":"kill_switch","data":"oops"}"#);
        assert_eq!(
            bad,
            FrameOutcome::Dispatched(DispatchReport { delivered: 0, failed: 1 })
        );

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, Some(3));
        assert!(seen[0].is_kill_switch());
    }
}
