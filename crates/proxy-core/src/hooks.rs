//! Per-direction packet event bus.
//!
//! Subscribers run synchronously in registration order with a mutable
//! context; they may rewrite the raw frame or cancel it. The bus never
//! re-parses a mutated frame — a subscriber that rewrites `raw` is
//! responsible for keeping it syntactically valid.

use crate::packet::Classified;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ServerBound,
    ClientBound,
}

impl Direction {
    pub fn event_name(self) -> &'static str {
        match self {
            Direction::ServerBound => "serverBoundPacket",
            Direction::ClientBound => "clientBoundPacket",
        }
    }
}

pub struct PacketEvent<'a> {
    pub direction: Direction,
    pub channel_id: u8,
    pub parsed: &'a Classified,
    pub raw: &'a mut Vec<u8>,
    pub canceled: bool,
}

pub type HookFn<C> = Box<dyn FnMut(&mut C, &mut PacketEvent<'_>) -> anyhow::Result<()> + Send>;

pub struct HookBus<C> {
    server_bound: Vec<HookFn<C>>,
    client_bound: Vec<HookFn<C>>,
}

impl<C> Default for HookBus<C> {
    fn default() -> Self {
        Self {
            server_bound: Vec::new(),
            client_bound: Vec::new(),
        }
    }
}

impl<C> HookBus<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &mut self,
        direction: Direction,
        hook: impl FnMut(&mut C, &mut PacketEvent<'_>) -> anyhow::Result<()> + Send + 'static,
    ) {
        match direction {
            Direction::ServerBound => self.server_bound.push(Box::new(hook)),
            Direction::ClientBound => self.client_bound.push(Box::new(hook)),
        }
    }

    pub fn subscriber_count(&self, direction: Direction) -> usize {
        match direction {
            Direction::ServerBound => self.server_bound.len(),
            Direction::ClientBound => self.client_bound.len(),
        }
    }

    /// Runs every subscriber for the event's direction. Subscriber errors
    /// are logged and do not stop the chain; the caller consults
    /// `event.canceled` afterwards.
    pub fn dispatch(&mut self, ctx: &mut C, event: &mut PacketEvent<'_>) {
        let hooks = match event.direction {
            Direction::ServerBound => &mut self.server_bound,
            Direction::ClientBound => &mut self.client_bound,
        };
        for hook in hooks.iter_mut() {
            if let Err(err) = hook(ctx, event) {
                tracing::warn!(
                    "hooks.subscriber_failed event={} error={err:#}",
                    event.direction.event_name()
                );
            }
        }
    }
}
