//! Event pipeline: nine lifecycle events, 40 priority slots each, with the
//! reject/allow/reason contract.
//!
//! Every event embeds a `NetworkEvent` base and, where applicable, a
//! `RejectPoint`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::chat::ChatMessage;
use crate::codec::{Handshake, LoginStart, StatusResponse};
use crate::upstream::UpstreamEntry;

pub const PRIORITY_SLOTS: usize = 40;

/// Fields shared by every event: who connected, and which connection this is.
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    pub remote_addr: SocketAddr,
    pub conn_id: u64,
}

/// Per-event veto record: a handler pipeline may reject (and re-allow) the
/// session, and attach a human-readable reason. The final state, read after
/// dispatch completes, is what governs the session state machine.
#[derive(Debug, Clone, Default)]
pub struct RejectPoint {
    rejected: bool,
    reason: String,
}

impl RejectPoint {
    pub fn allow(&mut self) {
        self.rejected = false;
    }

    pub fn reject(&mut self) {
        self.rejected = true;
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub fn rejected(&self) -> bool {
        self.rejected
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Clone)]
pub struct PostAcceptEvent {
    pub base: NetworkEvent,
    pub reject: RejectPoint,
}

#[derive(Debug, Clone)]
pub struct PreRoutingEvent {
    pub base: NetworkEvent,
    pub packet: Handshake,
    pub reject: RejectPoint,
}

#[derive(Debug, Clone)]
pub struct PingRequestEvent {
    pub base: NetworkEvent,
    pub packet: Handshake,
    pub upstream: Arc<UpstreamEntry>,
    pub reject: RejectPoint,
}

#[derive(Debug, Clone)]
pub struct LoginRequestEvent {
    pub base: NetworkEvent,
    pub init_packet: Handshake,
    pub login_packet: LoginStart,
    pub upstream: Arc<UpstreamEntry>,
    pub reject: RejectPoint,
}

#[derive(Debug, Clone)]
pub struct StartProxyEvent {
    pub base: NetworkEvent,
    pub init_packet: Handshake,
    pub login_packet: LoginStart,
    pub upstream: Arc<UpstreamEntry>,
}

#[derive(Debug, Clone)]
pub struct PreStatusResponseEvent {
    pub base: NetworkEvent,
    pub packet: StatusResponse,
    pub upstream: Arc<UpstreamEntry>,
}

#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub base: NetworkEvent,
}

/// Default rejection chat message used when a handler rejects without
/// supplying a reason.
pub fn default_reject_message(reason: &str) -> ChatMessage {
    let text = if reason.is_empty() {
        "Request was rejected by plugin."
    } else {
        reason
    };
    let mut msg = ChatMessage::new(text);
    msg.set_color("red");
    msg.set_bold(true);
    msg
}

type Handler<E> = Box<dyn Fn(&mut E) + Send + Sync>;

/// 40 priority-ordered handler slots for one event kind. Registration only
/// happens during startup/plugin init; dispatch walks every handler in every
/// slot regardless of the reject state observed so far — only the caller,
/// after dispatch returns, inspects the final `RejectPoint`.
pub struct EventSlots<E> {
    slots: Vec<Vec<Handler<E>>>,
}

impl<E> Default for EventSlots<E> {
    fn default() -> Self {
        let mut slots = Vec::with_capacity(PRIORITY_SLOTS);
        slots.resize_with(PRIORITY_SLOTS, Vec::new);
        EventSlots { slots }
    }
}

impl<E> EventSlots<E> {
    pub fn register(
        &mut self,
        priority: usize,
        handler: impl Fn(&mut E) + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        if priority >= PRIORITY_SLOTS {
            anyhow::bail!(
                "priority check failure: {priority} not in range [0, {}]",
                PRIORITY_SLOTS - 1
            );
        }
        self.slots[priority].push(Box::new(handler));
        Ok(())
    }

    pub fn dispatch(&self, event: &mut E) {
        for slot in &self.slots {
            for handler in slot {
                handler(event);
            }
        }
    }
}

/// The full set of nine lifecycle event slots, frozen after plugin/startup
/// registration.
#[derive(Default)]
pub struct EventBus {
    pub pre_load_config: EventSlots<()>,
    pub post_load_config: EventSlots<()>,
    pub post_accept: EventSlots<PostAcceptEvent>,
    pub pre_routing: EventSlots<PreRoutingEvent>,
    pub ping_request: EventSlots<PingRequestEvent>,
    pub login_request: EventSlots<LoginRequestEvent>,
    pub start_proxy: EventSlots<StartProxyEvent>,
    pub pre_status_response: EventSlots<PreStatusResponseEvent>,
    pub disconnect: EventSlots<DisconnectEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn priority_order_is_respected_within_and_across_slots() {
        let mut slots: EventSlots<PostAcceptEvent> = EventSlots::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (priority, tag) in [(5, "b"), (0, "a"), (5, "c")] {
            let order = Arc::clone(&order);
            slots
                .register(priority, move |_event| {
                    order.lock().unwrap().push(tag);
                })
                .unwrap();
        }

        let mut event = PostAcceptEvent {
            base: NetworkEvent {
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                conn_id: 0,
            },
            reject: RejectPoint::default(),
        };
        slots.dispatch(&mut event);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let mut slots: EventSlots<PostAcceptEvent> = EventSlots::default();
        assert!(slots.register(40, |_| {}).is_err());
    }

    #[test]
    fn every_handler_runs_even_after_rejection() {
        let mut slots: EventSlots<PostAcceptEvent> = EventSlots::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&calls);
        slots
            .register(0, move |event: &mut PostAcceptEvent| {
                event.reject.reject();
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let c2 = Arc::clone(&calls);
        slots
            .register(1, move |event: &mut PostAcceptEvent| {
                // Later handler observes and un-rejects; both still ran.
                event.reject.allow();
                c2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let mut event = PostAcceptEvent {
            base: NetworkEvent {
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                conn_id: 0,
            },
            reject: RejectPoint::default(),
        };
        slots.dispatch(&mut event);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!event.reject.rejected());
    }
}
