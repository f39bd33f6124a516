//! ENet host pump.
//!
//! Both hosts live on one dedicated thread: the inbound host listening
//! for the intercepted game client and the outbound host dialing the
//! real upstream. Commands arrive over a channel drained between service
//! passes; everything observed on the wire is funneled back to the relay
//! through the event sink, so no host state is ever touched from another
//! thread.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::Context;
use rusty_enet as enet;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Channels per session. Channel 0 carries everything observed in
/// practice; the spare keeps the frame path honest about channel ids.
pub const CHANNEL_COUNT: usize = 2;

/// Outbound peer table size; the reset pass walks every slot.
const OUTBOUND_PEER_SLOTS: usize = 4;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The intercepted game client's session to our listener.
    Inbound,
    /// Our own session to the real upstream server.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Tear down immediately, without notifying the peer.
    Now,
    /// Flush queued outgoing packets first.
    Later,
    /// Ordinary notify-and-wait disconnect.
    Normal,
}

#[derive(Debug)]
pub enum TransportEvent {
    Ready { side: Side },
    Connected { side: Side, peer: usize },
    Disconnected { side: Side },
    Frame { side: Side, channel_id: u8, data: Vec<u8> },
    ConnectFailed { side: Side, error: String },
    Fatal { error: String },
}

#[derive(Debug)]
pub enum TransportCmd {
    Dial { addr: SocketAddr },
    Send { side: Side, channel_id: u8, data: Vec<u8> },
    Disconnect { side: Side, mode: DisconnectMode },
    Shutdown,
}

/// Cloneable command sender handed to the relay and the injectors.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    cmds: UnboundedSender<TransportCmd>,
}

impl TransportHandle {
    pub fn new(cmds: UnboundedSender<TransportCmd>) -> Self {
        Self { cmds }
    }

    /// Queues a command for the pump; returns false when the pump is
    /// gone. Never panics on transport errors.
    pub fn send(&self, cmd: TransportCmd) -> bool {
        if self.cmds.send(cmd).is_err() {
            tracing::warn!("transport.command_channel_closed");
            return false;
        }
        true
    }
}

pub struct Transport {
    cmds: UnboundedSender<TransportCmd>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Transport {
    /// Starts the pump thread over the two pre-bound UDP sockets. Host
    /// construction failures surface as a `Fatal` event.
    pub fn spawn(
        listen_socket: UdpSocket,
        local_socket: UdpSocket,
        events: impl Fn(TransportEvent) + Send + 'static,
    ) -> anyhow::Result<Self> {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("enet-pump".to_string())
            .spawn(move || {
                let inbound = match build_host(listen_socket, 1) {
                    Ok(host) => host,
                    Err(err) => {
                        events(TransportEvent::Fatal {
                            error: format!("inbound host: {err:#}"),
                        });
                        return;
                    }
                };
                let outbound = match build_host(local_socket, OUTBOUND_PEER_SLOTS) {
                    Ok(host) => host,
                    Err(err) => {
                        events(TransportEvent::Fatal {
                            error: format!("outbound host: {err:#}"),
                        });
                        return;
                    }
                };
                Pump {
                    inbound,
                    outbound,
                    inbound_peer: None,
                    outbound_peer: None,
                    events,
                }
                .run(cmd_rx);
            })
            .context("spawn enet pump thread")?;

        Ok(Self {
            cmds: cmd_tx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle::new(self.cmds.clone())
    }

    /// Waits for the pump thread to exit. Send `TransportCmd::Shutdown`
    /// first or this blocks until the command channel closes.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_host(socket: UdpSocket, peer_limit: usize) -> anyhow::Result<enet::Host<UdpSocket>> {
    socket
        .set_nonblocking(true)
        .context("set socket non-blocking")?;
    enet::Host::new(
        socket,
        enet::HostSettings {
            peer_limit,
            channel_limit: CHANNEL_COUNT,
            ..Default::default()
        },
    )
    .map_err(|err| anyhow::anyhow!("create enet host: {err:?}"))
}

struct Pump<F: Fn(TransportEvent)> {
    inbound: enet::Host<UdpSocket>,
    outbound: enet::Host<UdpSocket>,
    inbound_peer: Option<enet::PeerID>,
    outbound_peer: Option<enet::PeerID>,
    events: F,
}

impl<F: Fn(TransportEvent)> Pump<F> {
    fn run(mut self, mut cmds: UnboundedReceiver<TransportCmd>) {
        (self.events)(TransportEvent::Ready {
            side: Side::Inbound,
        });

        loop {
            loop {
                match cmds.try_recv() {
                    Ok(cmd) => {
                        if !self.apply(cmd) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            self.pump_side(Side::Inbound);
            self.pump_side(Side::Outbound);
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn apply(&mut self, cmd: TransportCmd) -> bool {
        match cmd {
            TransportCmd::Dial { addr } => {
                self.dial(addr);
                true
            }
            TransportCmd::Send {
                side,
                channel_id,
                data,
            } => {
                self.send(side, channel_id, &data);
                true
            }
            TransportCmd::Disconnect { side, mode } => {
                self.disconnect(side, mode);
                true
            }
            TransportCmd::Shutdown => {
                self.disconnect(Side::Inbound, DisconnectMode::Now);
                self.disconnect(Side::Outbound, DisconnectMode::Now);
                false
            }
        }
    }

    fn pump_side(&mut self, side: Side) {
        let (host, slot) = match side {
            Side::Inbound => (&mut self.inbound, &mut self.inbound_peer),
            Side::Outbound => (&mut self.outbound, &mut self.outbound_peer),
        };
        let events = &self.events;
        loop {
            match host.service() {
                Ok(Some(event)) => match event {
                    enet::Event::Connect { peer, .. } => {
                        let id = peer.id();
                        *slot = Some(id);
                        events(TransportEvent::Connected {
                            side,
                            peer: id.0,
                        });
                    }
                    enet::Event::Disconnect { .. } => {
                        *slot = None;
                        events(TransportEvent::Disconnected { side });
                    }
                    enet::Event::Receive {
                        channel_id, packet, ..
                    } => {
                        events(TransportEvent::Frame {
                            side,
                            channel_id,
                            data: packet.data().to_vec(),
                        });
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("transport.service_error side={side:?} error={err:?}");
                    break;
                }
            }
        }
    }

    fn dial(&mut self, addr: SocketAddr) {
        self.outbound_peer = None;
        if self.outbound.connect(addr, CHANNEL_COUNT, 0).is_ok() {
            tracing::debug!("transport.dial addr={addr}");
            return;
        }

        // The library can leave stale peer slots behind after failed
        // dials; walk the table, force-reset anything non-idle, and
        // retry once.
        let mut reset = 0usize;
        for index in 0..OUTBOUND_PEER_SLOTS {
            let peer = self.outbound.peer_mut(enet::PeerID(index));
            if peer.state() != enet::PeerState::Disconnected {
                peer.reset();
                reset += 1;
            }
        }
        tracing::warn!("transport.dial.retry addr={addr} reset_slots={reset}");
        if let Err(err) = self.outbound.connect(addr, CHANNEL_COUNT, 0) {
            (self.events)(TransportEvent::ConnectFailed {
                side: Side::Outbound,
                error: format!("{err:?}"),
            });
        }
    }

    fn send(&mut self, side: Side, channel_id: u8, data: &[u8]) {
        let (host, slot) = match side {
            Side::Inbound => (&mut self.inbound, &self.inbound_peer),
            Side::Outbound => (&mut self.outbound, &self.outbound_peer),
        };
        let Some(id) = *slot else {
            tracing::debug!("transport.send.dropped side={side:?} reason=no_peer");
            return;
        };
        let packet = enet::Packet::reliable(data);
        if let Err(err) = host.peer_mut(id).send(channel_id, &packet) {
            tracing::warn!("transport.send_failed side={side:?} error={err:?}");
        }
    }

    fn disconnect(&mut self, side: Side, mode: DisconnectMode) {
        let (host, slot) = match side {
            Side::Inbound => (&mut self.inbound, &mut self.inbound_peer),
            Side::Outbound => (&mut self.outbound, &mut self.outbound_peer),
        };
        let Some(id) = *slot else {
            return;
        };
        let peer = host.peer_mut(id);
        match mode {
            DisconnectMode::Now => {
                peer.disconnect_now(0);
                // No local event follows an immediate teardown.
                *slot = None;
            }
            DisconnectMode::Later => peer.disconnect_later(0),
            DisconnectMode::Normal => peer.disconnect(0),
        }
        tracing::debug!("transport.disconnect side={side:?} mode={mode:?}");
    }
}
