//! End-to-end relay flow over the public API: discovery, handoff
//! rewrite, and reconnect against a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use growgate_core::config::{Config, DnsServer};
use growgate_core::packet::{classify, PacketId};
use growgate_core::tank::{TankFlags, TankHeader, TankPacket, PACKET_CALL_FUNCTION};
use growgate_core::variant::{VariantArg, VariantList};
use growgate_gateway::relay::{LoopMsg, PendingEndpoint, Relay};
use growgate_gateway::resolver::Resolver;
use growgate_gateway::transport::{Side, TransportCmd, TransportEvent, TransportHandle};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;

async fn next_cmd(rx: &mut UnboundedReceiver<TransportCmd>) -> TransportCmd {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport command")
        .expect("command channel closed")
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
async fn discovery_then_handoff_then_reconnect() {
    let (cmd_tx, mut cmd_rx) = unbounded_channel();
    let resolver = Arc::new(Resolver::new(&DnsServer::Cloudflare).unwrap());
    let mut relay = Relay::new(
        Arc::new(Config::default()),
        16999,
        TransportHandle::new(cmd_tx),
        resolver,
    );
    let sender = relay.sender();
    let endpoints = relay.endpoint_updates();
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });

    // Bootstrap discovery publishes the real endpoint; the client then
    // connects to our listener and we dial out.
    endpoints.set(PendingEndpoint::new("1.2.3.4", 17091));
    sender
        .send(LoopMsg::Transport(TransportEvent::Connected {
            side: Side::Inbound,
            peer: 0,
        }))
        .unwrap();
    match next_cmd(&mut cmd_rx).await {
        TransportCmd::Dial { addr } => assert_eq!(addr, "1.2.3.4:17091".parse().unwrap()),
        other => panic!("expected dial, got {other:?}"),
    }
    sender
        .send(LoopMsg::Transport(TransportEvent::Connected {
            side: Side::Outbound,
            peer: 0,
        }))
        .unwrap();

    // The upstream hands the session off to another world server.
    sender
        .send(LoopMsg::Transport(TransportEvent::Frame {
            side: Side::Outbound,
            channel_id: 0,
            data: send_to_server_frame(),
        }))
        .unwrap();
    let forwarded = match next_cmd(&mut cmd_rx).await {
        TransportCmd::Send {
            side: Side::Inbound,
            data,
            ..
        } => data,
        other => panic!("expected forwarded frame, got {other:?}"),
    };
    let classified = classify(&forwarded);
    assert_eq!(classified.id, PacketId::OnSendToServer);
    let variants = classified.as_tank().unwrap().variants.as_ref().unwrap();
    assert_eq!(variants.arg(1).unwrap().value().as_int(), Some(16999));
    assert_eq!(
        variants.arg(4).unwrap().value().as_str(),
        Some("127.0.0.1|door|uuid")
    );

    // When the old upstream drops the session, the relay dials the
    // handoff target.
    sender
        .send(LoopMsg::Transport(TransportEvent::Disconnected {
            side: Side::Outbound,
        }))
        .unwrap();
    match next_cmd(&mut cmd_rx).await {
        TransportCmd::Dial { addr } => assert_eq!(addr, "5.6.7.8:17000".parse().unwrap()),
        other => panic!("expected handoff dial, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_tears_both_peers_down() {
    let (cmd_tx, mut cmd_rx) = unbounded_channel();
    let resolver = Arc::new(Resolver::new(&DnsServer::Cloudflare).unwrap());
    let mut relay = Relay::new(
        Arc::new(Config::default()),
        16999,
        TransportHandle::new(cmd_tx),
        resolver,
    );
    let sender = relay.sender();
    let task = tokio::spawn(async move { relay.run().await });

    sender.send(LoopMsg::Shutdown).unwrap();
    let mut saw_shutdown = false;
    let mut disconnects = 0;
    for _ in 0..3 {
        match next_cmd(&mut cmd_rx).await {
            TransportCmd::Disconnect { .. } => disconnects += 1,
            TransportCmd::Shutdown => saw_shutdown = true,
            other => panic!("unexpected command {other:?}"),
        }
    }
    assert_eq!(disconnects, 2);
    assert!(saw_shutdown);
    timeout(Duration::from_secs(5), task)
        .await
        .expect("relay loop should exit")
        .unwrap()
        .unwrap();
}
