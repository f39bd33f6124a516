//! Synthetic packet senders.
//!
//! Everything here builds a frame with the core codecs and queues it on
//! the transport. Senders are no-ops returning `false` when the relevant
//! peer is absent, and they log rather than propagate transport errors,
//! so scripts can fire-and-forget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use growgate_core::packet::{encode_text_frame, MSG_GAME_MESSAGE};
use growgate_core::tank::{TankFlags, TankHeader, TankPacket, PACKET_CALL_FUNCTION};
use growgate_core::text::TextRecord;
use growgate_core::variant::{VariantArg, VariantList};

use crate::transport::{Side, TransportCmd, TransportHandle};

/// Options for [`Injector::send_variant_to_client`].
#[derive(Debug, Clone, Copy)]
pub struct VariantOpts {
    pub net_id: i32,
    pub target_net_id: i32,
    /// Client-side apply delay, written to the header's info field.
    pub delay: i32,
    pub channel_id: u8,
}

impl Default for VariantOpts {
    fn default() -> Self {
        Self {
            net_id: -1,
            target_net_id: 0,
            delay: 0,
            channel_id: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Injector {
    transport: TransportHandle,
    inbound_present: Arc<AtomicBool>,
    outbound_present: Arc<AtomicBool>,
}

impl Injector {
    pub(crate) fn new(transport: TransportHandle) -> Self {
        Self {
            transport,
            inbound_present: Arc::new(AtomicBool::new(false)),
            outbound_present: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn set_inbound_present(&self, present: bool) {
        self.inbound_present.store(present, Ordering::Relaxed);
    }

    pub(crate) fn set_outbound_present(&self, present: bool) {
        self.outbound_present.store(present, Ordering::Relaxed);
    }

    /// Client-visible console line.
    pub fn send_log(&self, message: &str) -> bool {
        let mut record = TextRecord::new();
        record.set("action", ["log"]);
        record.set("msg", [message]);
        self.send_text_to_client(&record)
    }

    pub fn send_quit_to_exit(&self) -> bool {
        let mut record = TextRecord::new();
        record.set("action", ["quit_to_exit"]);
        self.send_text_to_server(&record)
    }

    pub fn send_join_request(&self, world_name: &str, invited_world: &str) -> bool {
        let mut record = TextRecord::new();
        record.set("action", ["join_request"]);
        record.set("name", [world_name]);
        record.set("invitedWorld", [invited_world]);
        self.send_text_to_server(&record)
    }

    pub fn send_text_to_client(&self, record: &TextRecord) -> bool {
        self.send_to_client(0, encode_text_frame(MSG_GAME_MESSAGE, &record.serialize()))
    }

    pub fn send_text_to_server(&self, record: &TextRecord) -> bool {
        self.send_to_server(0, encode_text_frame(MSG_GAME_MESSAGE, &record.serialize()))
    }

    /// Emits a `CALL_FUNCTION` tank frame (trailing NUL included) with
    /// the function name prepended to the coerced argument list.
    pub fn send_variant_to_client(
        &self,
        function: &str,
        args: Vec<VariantArg>,
        opts: VariantOpts,
    ) -> bool {
        let extra = VariantList::for_call(function, args).encode();
        let header = TankHeader {
            packet_type: PACKET_CALL_FUNCTION,
            origin_net_id: opts.net_id,
            target_net_id: opts.target_net_id,
            state: TankFlags::EXTRA_DATA.bits(),
            info: opts.delay,
            ..Default::default()
        };
        let packet = TankPacket {
            header,
            extra,
            trailing_nul: true,
        };
        match packet.to_bytes() {
            Ok(bytes) => self.send_to_client(opts.channel_id, bytes),
            Err(err) => {
                tracing::warn!("inject.encode_failed function={function} error={err}");
                false
            }
        }
    }

    pub fn send_name_changed(&self, net_id: i32, name: &str) -> bool {
        self.send_variant_to_client(
            "OnNameChanged",
            vec![VariantArg::from(net_id), VariantArg::from(name)],
            VariantOpts {
                net_id,
                ..Default::default()
            },
        )
    }

    pub fn send_skin_change(&self, net_id: i32, skin: u32) -> bool {
        self.send_variant_to_client(
            "OnChangeSkin",
            vec![VariantArg::from(net_id), VariantArg::from(skin)],
            VariantOpts {
                net_id,
                ..Default::default()
            },
        )
    }

    pub fn send_to_client(&self, channel_id: u8, data: Vec<u8>) -> bool {
        if !self.inbound_present.load(Ordering::Relaxed) {
            tracing::debug!("inject.skipped dest=client reason=peer_absent");
            return false;
        }
        self.transport.send(TransportCmd::Send {
            side: Side::Inbound,
            channel_id,
            data,
        })
    }

    pub fn send_to_server(&self, channel_id: u8, data: Vec<u8>) -> bool {
        if !self.outbound_present.load(Ordering::Relaxed) {
            tracing::debug!("inject.skipped dest=server reason=peer_absent");
            return false;
        }
        self.transport.send(TransportCmd::Send {
            side: Side::Outbound,
            channel_id,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use growgate_core::packet::{classify, PacketId};
    use tokio::sync::mpsc::unbounded_channel;

    fn injector() -> (Injector, tokio::sync::mpsc::UnboundedReceiver<TransportCmd>) {
        let (tx, rx) = unbounded_channel();
        let injector = Injector::new(TransportHandle::new(tx));
        injector.set_inbound_present(true);
        injector.set_outbound_present(true);
        (injector, rx)
    }

    fn sent_frame(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TransportCmd>) -> (Side, u8, Vec<u8>) {
        match rx.try_recv().expect("frame queued") {
            TransportCmd::Send {
                side,
                channel_id,
                data,
            } => (side, channel_id, data),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn send_log_builds_game_message_to_client() {
        let (injector, mut rx) = injector();
        assert!(injector.send_log("hello `2world``"));
        let (side, channel, data) = sent_frame(&mut rx);
        assert_eq!(side, Side::Inbound);
        assert_eq!(channel, 0);
        let classified = classify(&data);
        assert_eq!(classified.id, PacketId::Log);
        let text = classified.as_text().unwrap();
        assert_eq!(text.kind, MSG_GAME_MESSAGE);
        assert_eq!(text.record.get("msg", 0), "hello `2world``");
    }

    #[test]
    fn send_join_request_targets_server() {
        let (injector, mut rx) = injector();
        assert!(injector.send_join_request("START", "0"));
        let (side, _, data) = sent_frame(&mut rx);
        assert_eq!(side, Side::Outbound);
        let classified = classify(&data);
        assert_eq!(classified.id, PacketId::JoinRequest);
        let record = &classified.as_text().unwrap().record;
        assert_eq!(record.get("name", 0), "START");
        assert_eq!(record.get("invitedWorld", 0), "0");
    }

    #[test]
    fn send_variant_builds_call_function_tank() {
        let (injector, mut rx) = injector();
        assert!(injector.send_variant_to_client(
            "OnChangeSkin",
            vec![VariantArg::Num(3.0), VariantArg::Num(4294967295.0)],
            VariantOpts {
                net_id: 3,
                delay: 100,
                ..Default::default()
            },
        ));
        let (side, _, data) = sent_frame(&mut rx);
        assert_eq!(side, Side::Inbound);
        let classified = classify(&data);
        assert_eq!(classified.id, PacketId::OnChangeSkin);
        assert!(classified.trailing_nul);
        let tank = classified.as_tank().unwrap();
        assert_eq!(tank.packet.header.origin_net_id, 3);
        assert_eq!(tank.packet.header.info, 100);
        let variants = tank.variants.as_ref().unwrap();
        assert_eq!(
            variants.arg(2).unwrap().value().as_int(),
            Some(4294967295)
        );
    }

    #[test]
    fn senders_noop_when_peer_absent() {
        let (injector, mut rx) = injector();
        injector.set_inbound_present(false);
        injector.set_outbound_present(false);
        assert!(!injector.send_log("dropped"));
        assert!(!injector.send_quit_to_exit());
        assert!(!injector.send_join_request("X", "0"));
        assert!(rx.try_recv().is_err());
    }
}
