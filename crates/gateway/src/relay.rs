//! The relay core: one task consuming every event the proxy produces.
//!
//! Transport events from both ENet endpoints, endpoint updates from the
//! HTTPS interceptor, and retry timer firings all funnel through a
//! single mpsc, so the pending endpoint, peer slots, world state, and
//! retry counter are only ever touched from this loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use growgate_core::command::CommandRegistry;
use growgate_core::config::Config;
use growgate_core::hooks::{Direction, HookBus, PacketEvent};
use growgate_core::packet::{classify, Classified, PacketBody, PacketId};
use growgate_core::scheduler::Scheduler;
use growgate_core::tank::TankPacket;
use growgate_core::text::TextRecord;
use growgate_core::variant::Variant;
use growgate_core::world::{Participant, World};

use crate::inject::Injector;
use crate::plugins::{self, PluginApi};
use crate::resolver::Resolver;
use crate::transport::{DisconnectMode, Side, TransportCmd, TransportEvent, TransportHandle};

/// Hard budget of outbound dials per session.
pub const MAX_CONNECT_ATTEMPTS: u32 = 12;

const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_CAP: Duration = Duration::from_millis(3000);
const RETRY_TAG: &str = "reconnect";

/// The next upstream the outbound side should dial, populated by the
/// HTTPS bootstrap or an in-band `OnSendToServer` handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEndpoint {
    pub host: String,
    pub port: u16,
}

impl PendingEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port >= 1
    }
}

#[derive(Debug)]
pub enum LoopMsg {
    Transport(TransportEvent),
    Endpoint(PendingEndpoint),
    DialReady(SocketAddr),
    DialFailed(String),
    Retry,
    Shutdown,
}

/// Sender the HTTPS interceptor uses to publish a freshly discovered
/// upstream endpoint into the relay loop.
#[derive(Debug, Clone)]
pub struct EndpointUpdates(UnboundedSender<LoopMsg>);

impl EndpointUpdates {
    pub fn set(&self, endpoint: PendingEndpoint) {
        let _ = self.0.send(LoopMsg::Endpoint(endpoint));
    }
}

/// Everything command handlers and hook subscribers get to touch.
pub struct Services {
    pub injector: Injector,
    pub world: World,
    pub scheduler: Scheduler,
    pub config: Arc<Config>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundSlot {
    Absent,
    Connecting,
    Ready,
}

pub struct Relay {
    config: Arc<Config>,
    listen_port: u16,
    transport: TransportHandle,
    rx: UnboundedReceiver<LoopMsg>,
    tx: UnboundedSender<LoopMsg>,
    resolver: Arc<Resolver>,
    services: Services,
    commands: CommandRegistry<Services>,
    hooks: HookBus<Services>,
    inbound: Option<usize>,
    outbound: OutboundSlot,
    pending: Option<PendingEndpoint>,
    /// Endpoint of the current/last dial, kept so retries survive the
    /// pending slot being consumed on initiation.
    dialing: Option<PendingEndpoint>,
    attempts: u32,
}

impl Relay {
    pub fn new(
        config: Arc<Config>,
        listen_port: u16,
        transport: TransportHandle,
        resolver: Arc<Resolver>,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        Self::with_channel(config, listen_port, transport, resolver, tx, rx)
    }

    /// Builds the relay over an externally created loop channel, so the
    /// transport sink can be wired up before the relay exists.
    pub fn with_channel(
        config: Arc<Config>,
        listen_port: u16,
        transport: TransportHandle,
        resolver: Arc<Resolver>,
        tx: UnboundedSender<LoopMsg>,
        rx: UnboundedReceiver<LoopMsg>,
    ) -> Self {
        let injector = Injector::new(transport.clone());
        let commands = CommandRegistry::new(config.command_prefix());
        Self {
            services: Services {
                injector,
                world: World::new(),
                scheduler: Scheduler::new(),
                config: config.clone(),
            },
            commands,
            hooks: HookBus::new(),
            config,
            listen_port,
            transport,
            rx,
            tx,
            resolver,
            inbound: None,
            outbound: OutboundSlot::Absent,
            pending: None,
            dialing: None,
            attempts: 0,
        }
    }

    /// Sender for feeding the loop; the runner wraps transport events
    /// with it and the shutdown path posts through it.
    pub fn sender(&self) -> UnboundedSender<LoopMsg> {
        self.tx.clone()
    }

    pub fn endpoint_updates(&self) -> EndpointUpdates {
        EndpointUpdates(self.tx.clone())
    }

    pub fn injector(&self) -> Injector {
        self.services.injector.clone()
    }

    pub fn commands_mut(&mut self) -> &mut CommandRegistry<Services> {
        &mut self.commands
    }

    pub fn hooks_mut(&mut self) -> &mut HookBus<Services> {
        &mut self.hooks
    }

    pub fn install_builtin_plugins(&mut self) {
        let mut api = PluginApi {
            commands: &mut self.commands,
            hooks: &mut self.hooks,
            config: self.config.clone(),
        };
        plugins::install_builtins(&mut api);
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        while let Some(msg) = self.rx.recv().await {
            if !self.handle(msg) {
                break;
            }
        }
        Ok(())
    }

    /// Cancels timers, tears both peers down, and stops the pump.
    pub fn shutdown(&mut self) {
        tracing::info!("relay.shutdown");
        self.services.scheduler.cancel_all();
        self.transport.send(TransportCmd::Disconnect {
            side: Side::Inbound,
            mode: DisconnectMode::Now,
        });
        self.transport.send(TransportCmd::Disconnect {
            side: Side::Outbound,
            mode: DisconnectMode::Now,
        });
        self.transport.send(TransportCmd::Shutdown);
        self.inbound = None;
        self.set_outbound(OutboundSlot::Absent);
        self.services.injector.set_inbound_present(false);
    }

    fn set_outbound(&mut self, slot: OutboundSlot) {
        self.outbound = slot;
        self.services
            .injector
            .set_outbound_present(slot == OutboundSlot::Ready);
    }

    fn handle(&mut self, msg: LoopMsg) -> bool {
        match msg {
            LoopMsg::Transport(event) => self.on_transport(event),
            LoopMsg::Endpoint(endpoint) => {
                tracing::info!(
                    "relay.endpoint.updated host={} port={}",
                    endpoint.host,
                    endpoint.port
                );
                self.pending = Some(endpoint);
                if self.inbound.is_some() && self.outbound == OutboundSlot::Absent {
                    self.connect_outbound(false);
                }
                true
            }
            LoopMsg::DialReady(addr) => {
                self.transport.send(TransportCmd::Dial { addr });
                true
            }
            LoopMsg::DialFailed(error) => {
                tracing::warn!("relay.outbound.resolve_failed error={error}");
                self.on_connect_failed();
                true
            }
            LoopMsg::Retry => {
                self.connect_outbound(true);
                true
            }
            LoopMsg::Shutdown => {
                self.shutdown();
                false
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Ready { side: Side::Inbound } => {
                tracing::info!("relay.listener.ready port={}", self.listen_port);
            }
            TransportEvent::Ready { .. } => {}
            TransportEvent::Connected {
                side: Side::Inbound,
                peer,
            } => {
                tracing::info!("relay.inbound.connected peer={peer}");
                self.inbound = Some(peer);
                self.services.injector.set_inbound_present(true);
                if self.pending.as_ref().is_some_and(PendingEndpoint::is_valid) {
                    self.connect_outbound(false);
                } else {
                    tracing::info!("relay.inbound.waiting_for_endpoint");
                }
            }
            TransportEvent::Connected {
                side: Side::Outbound,
                peer,
            } => {
                tracing::info!("relay.outbound.connected peer={peer}");
                self.set_outbound(OutboundSlot::Ready);
                self.attempts = 0;
            }
            TransportEvent::Disconnected { side: Side::Inbound } => {
                if self.inbound.take().is_some() {
                    tracing::info!("relay.inbound.disconnected");
                    self.attempts = 0;
                    self.services.scheduler.cancel(RETRY_TAG);
                    self.services.injector.set_inbound_present(false);
                    self.services.world.clear();
                    // A valid endpoint survives for the immediate
                    // reconnect; anything else is dropped with the
                    // session.
                    if !self.pending.as_ref().is_some_and(PendingEndpoint::is_valid) {
                        self.pending = None;
                    }
                    self.dialing = None;
                    if self.outbound != OutboundSlot::Absent {
                        self.transport.send(TransportCmd::Disconnect {
                            side: Side::Outbound,
                            mode: DisconnectMode::Later,
                        });
                        self.set_outbound(OutboundSlot::Absent);
                    }
                }
            }
            TransportEvent::Disconnected {
                side: Side::Outbound,
            } => {
                if self.outbound != OutboundSlot::Absent {
                    tracing::info!("relay.outbound.disconnected");
                    self.set_outbound(OutboundSlot::Absent);
                    if self.inbound.is_some()
                        && self.pending.as_ref().is_some_and(PendingEndpoint::is_valid)
                    {
                        self.connect_outbound(false);
                    } else if self.inbound.is_some() {
                        self.transport.send(TransportCmd::Disconnect {
                            side: Side::Inbound,
                            mode: DisconnectMode::Later,
                        });
                    }
                }
            }
            TransportEvent::ConnectFailed {
                side: Side::Outbound,
                error,
            } => {
                tracing::warn!("relay.outbound.connect_failed error={error}");
                self.on_connect_failed();
            }
            TransportEvent::ConnectFailed { .. } => {}
            TransportEvent::Frame {
                side,
                channel_id,
                data,
            } => self.on_frame(side, channel_id, data),
            TransportEvent::Fatal { error } => {
                tracing::error!("relay.transport_fatal error={error}");
                return false;
            }
        }
        true
    }

    /// Starts (or schedules) an outbound dial. `use_last_target` lets
    /// retries fall back to the endpoint of the failed dial after the
    /// pending slot was consumed on initiation.
    fn connect_outbound(&mut self, use_last_target: bool) {
        if self.inbound.is_none() {
            tracing::debug!("relay.outbound.skip reason=no_inbound_peer");
            return;
        }
        if self.outbound != OutboundSlot::Absent {
            // An existing peer means this is a re-dial; tear it down and
            // come back through the retry timer instead of double
            // connecting.
            tracing::info!("relay.outbound.busy action=disconnect_then_retry");
            self.transport.send(TransportCmd::Disconnect {
                side: Side::Outbound,
                mode: DisconnectMode::Now,
            });
            self.set_outbound(OutboundSlot::Absent);
            let tx = self.tx.clone();
            self.services.scheduler.schedule(RETRY_TAG, RETRY_BASE, move || {
                let _ = tx.send(LoopMsg::Retry);
            });
            return;
        }

        let pending = self
            .pending
            .take()
            .filter(PendingEndpoint::is_valid);
        let target = match pending {
            Some(endpoint) => endpoint,
            None if use_last_target => match self.dialing.clone() {
                Some(endpoint) => endpoint,
                None => {
                    tracing::info!("relay.outbound.skip reason=no_endpoint");
                    return;
                }
            },
            None => {
                tracing::info!("relay.outbound.skip reason=no_endpoint");
                return;
            }
        };

        tracing::info!(
            "relay.outbound.connect host={} port={}",
            target.host,
            target.port
        );
        self.set_outbound(OutboundSlot::Connecting);
        self.dialing = Some(target.clone());

        // Resolution funnels back into the loop so the frame path never
        // blocks on DNS.
        if let Ok(ip) = target.host.parse::<IpAddr>() {
            let _ = self
                .tx
                .send(LoopMsg::DialReady(SocketAddr::new(ip, target.port)));
            return;
        }
        let resolver = self.resolver.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let ips = resolver.ipv4(&target.host, 1).await;
            let msg = match ips.first() {
                Some(ip) => LoopMsg::DialReady(SocketAddr::new(IpAddr::V4(*ip), target.port)),
                None => LoopMsg::DialFailed(format!("no ipv4 address for {}", target.host)),
            };
            let _ = tx.send(msg);
        });
    }

    fn on_connect_failed(&mut self) {
        self.set_outbound(OutboundSlot::Absent);
        self.attempts += 1;
        let attempt = self.attempts;
        if attempt >= MAX_CONNECT_ATTEMPTS {
            tracing::warn!("relay.outbound.retry attempt={attempt} budget=exhausted");
            return;
        }
        let delay = (RETRY_BASE * attempt).min(RETRY_CAP);
        tracing::info!(
            "relay.outbound.retry attempt={attempt} delay_ms={}",
            delay.as_millis()
        );
        let tx = self.tx.clone();
        self.services.scheduler.schedule(RETRY_TAG, delay, move || {
            let _ = tx.send(LoopMsg::Retry);
        });
    }

    fn on_frame(&mut self, side: Side, channel_id: u8, mut data: Vec<u8>) {
        let direction = match side {
            Side::Inbound => Direction::ServerBound,
            Side::Outbound => Direction::ClientBound,
        };
        let parsed = classify(&data);
        self.log_traffic(direction, channel_id, &parsed);

        match direction {
            Direction::ServerBound => match parsed.id {
                PacketId::JoinRequest => {
                    self.services.world.clear();
                }
                PacketId::Input => {
                    if self.dispatch_input(&parsed) {
                        tracing::debug!("relay.command.consumed channel={channel_id}");
                        return;
                    }
                }
                PacketId::Quit => {
                    tracing::info!("relay.client.quit");
                    self.transport.send(TransportCmd::Disconnect {
                        side: Side::Inbound,
                        mode: DisconnectMode::Normal,
                    });
                    self.transport.send(TransportCmd::Disconnect {
                        side: Side::Outbound,
                        mode: DisconnectMode::Now,
                    });
                    self.set_outbound(OutboundSlot::Absent);
                    return;
                }
                PacketId::Disconnect => {
                    tracing::info!("relay.client.hard_disconnect");
                    self.transport.send(TransportCmd::Disconnect {
                        side: Side::Inbound,
                        mode: DisconnectMode::Now,
                    });
                    self.transport.send(TransportCmd::Disconnect {
                        side: Side::Outbound,
                        mode: DisconnectMode::Now,
                    });
                    self.inbound = None;
                    self.services.injector.set_inbound_present(false);
                    self.set_outbound(OutboundSlot::Absent);
                    return;
                }
                _ => {}
            },
            Direction::ClientBound => match parsed.id {
                PacketId::OnSpawn => self.observe_spawn(&parsed),
                PacketId::OnRemove => self.observe_remove(&parsed),
                PacketId::OnSendToServer => {
                    if let Some(rewritten) = self.rewrite_send_to_server(&parsed) {
                        data = rewritten;
                    }
                }
                _ => {}
            },
        }

        let mut event = PacketEvent {
            direction,
            channel_id,
            parsed: &parsed,
            raw: &mut data,
            canceled: false,
        };
        self.hooks.dispatch(&mut self.services, &mut event);
        if event.canceled {
            tracing::debug!(
                "relay.hook.canceled event={} channel={channel_id}",
                direction.event_name()
            );
            return;
        }

        let dest = match direction {
            Direction::ServerBound => Side::Outbound,
            Direction::ClientBound => Side::Inbound,
        };
        let present = match dest {
            Side::Outbound => self.outbound == OutboundSlot::Ready,
            Side::Inbound => self.inbound.is_some(),
        };
        if !present {
            tracing::debug!("relay.forward.dropped dest={dest:?} reason=peer_absent");
            return;
        }
        self.transport.send(TransportCmd::Send {
            side: dest,
            channel_id,
            data,
        });
    }

    /// Runs the command dispatcher over the candidate strings of an
    /// `Input` frame. True means the frame is consumed.
    fn dispatch_input(&mut self, parsed: &Classified) -> bool {
        let Some(text) = parsed.as_text() else {
            return false;
        };
        let mut candidates: Vec<String> = Vec::new();
        if let Some(cached) = &text.input_text {
            candidates.push(cached.clone());
        }
        if let Some(fallback) = fallback_input_line(&text.text) {
            if !candidates.contains(&fallback) {
                candidates.push(fallback);
            }
        }
        for candidate in candidates {
            if self.commands.execute(&candidate, &mut self.services) {
                return true;
            }
        }
        false
    }

    fn observe_spawn(&mut self, parsed: &Classified) {
        let Some(payload) = call_payload_record(parsed) else {
            return;
        };
        match Participant::from_spawn_record(&payload) {
            Some(participant) => {
                tracing::debug!(
                    "relay.world.spawn net_id={} name={} type={}",
                    participant.net_id,
                    participant.name,
                    participant.kind
                );
                self.services.world.on_spawn(participant);
            }
            None => tracing::debug!("relay.world.spawn_rejected reason=bad_net_id"),
        }
    }

    fn observe_remove(&mut self, parsed: &Classified) {
        let Some(payload) = call_payload_record(parsed) else {
            return;
        };
        let net_id = payload.get_int("netID", 0, -1);
        if net_id >= 0 {
            tracing::debug!("relay.world.remove net_id={net_id}");
            self.services.world.on_remove(net_id as i32);
        }
    }

    /// Rewrites an `OnSendToServer` handoff so the client re-connects to
    /// our listener: argument 1 becomes the proxy port and argument 4's
    /// leading address becomes loopback, the rest of the route text
    /// untouched. Returns the rebuilt frame, or `None` to forward the
    /// original payload when anything about it does not line up.
    fn rewrite_send_to_server(&mut self, parsed: &Classified) -> Option<Vec<u8>> {
        let tank = parsed.as_tank()?;
        let variants = tank.variants.as_ref()?;

        let port = variants
            .arg(1)?
            .value()
            .as_int()
            .filter(|port| (1..=65535).contains(port))? as u16;
        let route = variants.arg(4)?.value().as_str()?.to_string();
        let (host, rest) = match route.split_once('|') {
            Some((host, rest)) => (host.to_string(), Some(rest.to_string())),
            None => (route.clone(), None),
        };
        let endpoint = PendingEndpoint::new(&host, port);
        if !endpoint.is_valid() {
            tracing::warn!("relay.handoff.invalid host={host:?} port={port}");
            return None;
        }

        let mut rewritten = variants.clone();
        {
            let entry = rewritten.arg_mut(1)?;
            let replacement = match entry.value() {
                Variant::Unsigned(_) => Variant::Unsigned(u32::from(self.listen_port)),
                Variant::Signed(_) => Variant::Signed(i32::from(self.listen_port)),
                _ => {
                    tracing::warn!("relay.handoff.unexpected_port_type");
                    return None;
                }
            };
            entry.set_value(replacement);
        }
        {
            let patched = match &rest {
                Some(rest) => format!("127.0.0.1|{rest}"),
                None => "127.0.0.1".to_string(),
            };
            rewritten.arg_mut(4)?.set_value(Variant::Str(patched));
        }

        let frame = TankPacket {
            header: tank.packet.header.clone(),
            extra: rewritten.encode(),
            trailing_nul: parsed.trailing_nul,
        };
        let bytes = match frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("relay.handoff.encode_failed error={err}");
                return None;
            }
        };

        tracing::info!(
            "relay.handoff host={} port={}",
            endpoint.host,
            endpoint.port
        );
        self.pending = Some(endpoint);
        if self.inbound.is_some() && self.outbound == OutboundSlot::Absent {
            self.connect_outbound(false);
        }
        // With an outbound peer up, the endpoint waits for the next
        // reconnect cycle.
        Some(bytes)
    }

    fn log_traffic(&self, direction: Direction, channel_id: u8, parsed: &Classified) {
        let gates = &self.config.log;
        match &parsed.body {
            PacketBody::Text(text) => {
                if gates.print_message {
                    tracing::info!(
                        "relay.message event={} channel={channel_id} id={:?} text={:?}",
                        direction.event_name(),
                        parsed.id,
                        text.text
                    );
                }
            }
            PacketBody::Tank(tank) => {
                if gates.print_game_update_packet {
                    tracing::info!(
                        "relay.tank event={} channel={channel_id} type={} net_id={} flags={:#x} extra_len={}",
                        direction.event_name(),
                        tank.packet.header.packet_type,
                        tank.packet.header.origin_net_id,
                        tank.packet.header.state,
                        tank.packet.extra.len()
                    );
                }
                if gates.print_variant {
                    if let Some(variants) = &tank.variants {
                        tracing::info!(
                            "relay.variant event={} function={:?} args={}",
                            direction.event_name(),
                            variants.function_name(),
                            variants.len()
                        );
                    }
                }
                if gates.print_extra && !tank.packet.extra.is_empty() {
                    tracing::info!(
                        "relay.extra event={} bytes={}",
                        direction.event_name(),
                        hex_prefix(&tank.packet.extra, 64)
                    );
                }
            }
            PacketBody::Raw => {}
        }
    }

    #[cfg(test)]
    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.handle(msg);
        }
    }
}

/// Second string argument of a function-call packet, parsed as a pipe
/// record (`OnSpawn`/`OnRemove` payloads).
fn call_payload_record(parsed: &Classified) -> Option<TextRecord> {
    let variants = parsed.as_tank()?.variants.as_ref()?;
    let mut strings = variants
        .entries()
        .iter()
        .filter_map(|entry| entry.value().as_str());
    let _function = strings.next()?;
    Some(TextRecord::parse(strings.next()?))
}

/// Fallback command source for malformed client input: the first body
/// line in `text|…` or `|text|…` form, prefix stripped.
fn fallback_input_line(text: &str) -> Option<String> {
    for line in text.split('\n') {
        if let Some(rest) = line.strip_prefix("|text|") {
            return Some(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("text|") {
            return Some(rest.to_string());
        }
    }
    None
}

fn hex_prefix(bytes: &[u8], max_len: usize) -> String {
    bytes
        .iter()
        .take(max_len)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use growgate_core::config::DnsServer;
    use growgate_core::packet::{encode_text_frame, MSG_GENERIC_TEXT};
    use growgate_core::tank::{TankFlags, TankHeader, PACKET_CALL_FUNCTION};
    use growgate_core::variant::{VariantArg, VariantList};

    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_relay() -> (Relay, UnboundedReceiver<TransportCmd>) {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let transport = TransportHandle::new(cmd_tx);
        let resolver = Arc::new(Resolver::new(&DnsServer::Cloudflare).expect("resolver"));
        let relay = Relay::new(Arc::new(Config::default()), 16999, transport, resolver);
        (relay, cmd_rx)
    }

    fn connected(side: Side) -> LoopMsg {
        LoopMsg::Transport(TransportEvent::Connected { side, peer: 0 })
    }

    fn frame(side: Side, data: Vec<u8>) -> LoopMsg {
        LoopMsg::Transport(TransportEvent::Frame {
            side,
            channel_id: 0,
            data,
        })
    }

    fn connect_failed() -> LoopMsg {
        LoopMsg::Transport(TransportEvent::ConnectFailed {
            side: Side::Outbound,
            error: "connection refused".to_string(),
        })
    }

    fn send_to_server_frame() -> Vec<u8> {
        let extra = VariantList::for_call(
            "OnSendToServer",
            vec![
                VariantArg::Num(17000.0),
                VariantArg::Num(7.0),
                VariantArg::Num(12.0),
                VariantArg::Text("5.6.7.8|door|uuid".into()),
                VariantArg::Num(0.0),
                VariantArg::Text("player".into()),
            ],
        )
        .encode();
        let header = TankHeader {
            packet_type: PACKET_CALL_FUNCTION,
            state: TankFlags::EXTRA_DATA.bits(),
            ..Default::default()
        };
        TankPacket {
            header,
            extra,
            trailing_nul: true,
        }
        .to_bytes()
        .unwrap()
    }

    #[tokio::test]
    async fn endpoint_then_inbound_connect_dials_upstream() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(LoopMsg::Endpoint(PendingEndpoint::new("1.2.3.4", 17091)));
        relay.handle(connected(Side::Inbound));
        relay.drain();
        match cmds.try_recv().expect("dial issued") {
            TransportCmd::Dial { addr } => {
                assert_eq!(addr, "1.2.3.4:17091".parse().unwrap());
            }
            other => panic!("expected dial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_connect_without_endpoint_waits() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.drain();
        assert!(cmds.try_recv().is_err());
    }

    #[tokio::test]
    async fn handoff_rewrites_port_and_route() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.handle(frame(Side::Outbound, send_to_server_frame()));

        // The rewritten frame is forwarded to the client.
        let forwarded = loop {
            match cmds.try_recv().expect("forwarded frame") {
                TransportCmd::Send {
                    side: Side::Inbound,
                    data,
                    ..
                } => break data,
                TransportCmd::Dial { .. } => continue,
                other => panic!("unexpected command {other:?}"),
            }
        };
        let classified = classify(&forwarded);
        assert_eq!(classified.id, PacketId::OnSendToServer);
        let variants = classified.as_tank().unwrap().variants.as_ref().unwrap();
        assert_eq!(variants.arg(1).unwrap().value().as_int(), Some(16999));
        let route = variants.arg(4).unwrap().value().as_str().unwrap();
        assert!(route.starts_with("127.0.0.1|"), "route was {route:?}");
        assert_eq!(route, "127.0.0.1|door|uuid");
        assert!(classified.trailing_nul);

        // The decoded upstream becomes the dial target.
        relay.drain();
        let mut saw_dial = false;
        while let Ok(cmd) = cmds.try_recv() {
            if let TransportCmd::Dial { addr } = cmd {
                assert_eq!(addr, "5.6.7.8:17000".parse().unwrap());
                saw_dial = true;
            }
        }
        assert!(saw_dial, "handoff should trigger an outbound dial");
    }

    #[tokio::test]
    async fn handoff_with_outbound_up_keeps_endpoint_for_reconnect() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.handle(connected(Side::Outbound));
        relay.handle(frame(Side::Outbound, send_to_server_frame()));
        relay.drain();

        // Forwarded rewrite only; no dial while the outbound peer is up.
        let mut dials = 0;
        while let Ok(cmd) = cmds.try_recv() {
            if matches!(cmd, TransportCmd::Dial { .. }) {
                dials += 1;
            }
        }
        assert_eq!(dials, 0);
        assert_eq!(
            relay.pending,
            Some(PendingEndpoint::new("5.6.7.8", 17000))
        );

        // The upstream dropping the session triggers the handoff dial.
        relay.handle(LoopMsg::Transport(TransportEvent::Disconnected {
            side: Side::Outbound,
        }));
        relay.drain();
        let mut saw_dial = false;
        while let Ok(cmd) = cmds.try_recv() {
            if let TransportCmd::Dial { addr } = cmd {
                assert_eq!(addr, "5.6.7.8:17000".parse().unwrap());
                saw_dial = true;
            }
        }
        assert!(saw_dial);
    }

    #[tokio::test]
    async fn input_command_is_intercepted_and_dropped() {
        let (mut relay, mut cmds) = test_relay();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        relay.commands_mut().register("warp", move |_, args| {
            sink.lock().unwrap().push(args.join(" "));
            Ok(())
        });
        relay.handle(connected(Side::Inbound));
        relay.handle(connected(Side::Outbound));

        let input = encode_text_frame(MSG_GENERIC_TEXT, "action|input\ntext|\u{0}/warp FOO");
        relay.handle(frame(Side::Inbound, input));
        assert!(cmds.try_recv().is_err(), "command frame must not forward");
        assert_eq!(seen.lock().unwrap().as_slice(), ["FOO".to_string()]);
    }

    #[tokio::test]
    async fn non_command_input_is_forwarded() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.handle(connected(Side::Outbound));

        let input = encode_text_frame(MSG_GENERIC_TEXT, "action|input\ntext|hello there");
        relay.handle(frame(Side::Inbound, input.clone()));
        match cmds.try_recv().expect("forwarded") {
            TransportCmd::Send {
                side: Side::Outbound,
                data,
                ..
            } => assert_eq!(data, input),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn fallback_input_line_accepts_both_forms() {
        assert_eq!(
            fallback_input_line("action|input\ntext|/warp A"),
            Some("/warp A".to_string())
        );
        assert_eq!(
            fallback_input_line("action|input\n|text|/warp B"),
            Some("/warp B".to_string())
        );
        assert_eq!(fallback_input_line("action|input"), None);
    }

    #[tokio::test]
    async fn quit_cancels_and_disconnects_both_sides() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.handle(connected(Side::Outbound));

        let quit = encode_text_frame(MSG_GENERIC_TEXT, "action|quit");
        relay.handle(frame(Side::Inbound, quit));

        let mut saw = Vec::new();
        while let Ok(cmd) = cmds.try_recv() {
            match cmd {
                TransportCmd::Disconnect { side, mode } => saw.push((side, mode)),
                TransportCmd::Send { .. } => panic!("quit must not forward"),
                _ => {}
            }
        }
        assert!(saw.contains(&(Side::Inbound, DisconnectMode::Normal)));
        assert!(saw.contains(&(Side::Outbound, DisconnectMode::Now)));
    }

    #[tokio::test]
    async fn client_bound_spawn_updates_world_and_forwards() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));

        let extra = VariantList::for_call(
            "OnSpawn",
            vec![VariantArg::Text(
                "spawn|avatar\nnetID|9\nuserID|42\nname|Visitor\ntype|local".into(),
            )],
        )
        .encode();
        let header = TankHeader {
            packet_type: PACKET_CALL_FUNCTION,
            state: TankFlags::EXTRA_DATA.bits(),
            ..Default::default()
        };
        let bytes = TankPacket {
            header,
            extra,
            trailing_nul: true,
        }
        .to_bytes()
        .unwrap();
        relay.handle(frame(Side::Outbound, bytes));

        assert_eq!(relay.services.world.local_net_id(), 9);
        assert_eq!(relay.services.world.len(), 1);
        match cmds.try_recv().expect("spawn forwards to client") {
            TransportCmd::Send {
                side: Side::Inbound,
                ..
            } => {}
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_request_clears_world() {
        let (mut relay, _cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.services.world.on_spawn(growgate_core::world::Participant {
            net_id: 3,
            kind: "local".into(),
            ..Default::default()
        });

        let join = encode_text_frame(
            MSG_GENERIC_TEXT,
            "action|join_request\nname|START\ninvitedWorld|0",
        );
        relay.handle(frame(Side::Inbound, join));
        assert!(relay.services.world.is_empty());
        assert_eq!(relay.services.world.local_net_id(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_twelve_dials() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.handle(LoopMsg::Endpoint(PendingEndpoint::new("1.2.3.4", 17091)));

        let dials = Arc::new(AtomicUsize::new(0));
        for _ in 0..40 {
            relay.drain();
            while let Ok(cmd) = cmds.try_recv() {
                if matches!(cmd, TransportCmd::Dial { .. }) {
                    dials.fetch_add(1, Ordering::SeqCst);
                    relay.handle(connect_failed());
                }
            }
            // Let any scheduled retry timer fire (auto-advanced).
            tokio::time::sleep(Duration::from_secs(4)).await;
        }
        assert_eq!(dials.load(Ordering::SeqCst), MAX_CONNECT_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_disconnect_resets_retry_budget() {
        let (mut relay, mut cmds) = test_relay();
        relay.handle(connected(Side::Inbound));
        relay.handle(LoopMsg::Endpoint(PendingEndpoint::new("1.2.3.4", 17091)));
        relay.drain();
        while cmds.try_recv().is_ok() {}
        relay.handle(connect_failed());
        assert_eq!(relay.attempts, 1);

        relay.handle(LoopMsg::Transport(TransportEvent::Disconnected {
            side: Side::Inbound,
        }));
        assert_eq!(relay.attempts, 0);
        assert!(relay.services.world.is_empty());
    }
}
