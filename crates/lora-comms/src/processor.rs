//! MessageProcessor - turns transport bytes into mesh events
//!
//! The processor owns everything that outlives a single chunk of bytes:
//! per-transport frame reassembly, the deduplication window, the node
//! registry and outstanding acknowledgements.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      MessageProcessor                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌──────────────┐   bytes   ┌─────────────┐   ┌────────────┐   │
//! │  │ Transport    │──────────►│ FrameCodec  │──►│ PacketCodec│   │
//! │  │ Session      │           │ (per link)  │   └─────┬──────┘   │
//! │  └──────▲───────┘           └─────────────┘         │          │
//! │         │ frames                              ┌─────▼──────┐   │
//! │         │                                     │ Dedup      │   │
//! │  ┌──────┴───────┐   acks    ┌─────────────┐   └─────┬──────┘   │
//! │  │ send_text    │◄──────────│ Routing     │◄────────┤          │
//! │  └──────────────┘           └─────────────┘   ┌─────▼──────┐   │
//! │                                               │ Registry   │   │
//! │                     broadcast::Sender ◄───────┤ + dispatch │   │
//! │                                               └────────────┘   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use lora_comms::{Destination, MessageProcessor, Priority, ProcessorConfig};
//!
//! let processor = MessageProcessor::new(ProcessorConfig::default());
//! let mut events = processor.subscribe();
//! let reader = processor.attach(session);
//!
//! processor.send_text(Destination::Broadcast, "hello mesh", Priority::DEFAULT).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.kind());
//! }
//! ```

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ProcessorConfig, BROADCAST_ADDR, LORA_MAX_PAYLOAD, MAX_HOP_LIMIT};
use crate::content::{MessageContent, Routing};
use crate::dedup::DeduplicationCache;
use crate::error::{LoraCommsError, SendError, TransportError};
use crate::event::MeshEvent;
use crate::frame::FrameCodec;
use crate::packet::{Data, MeshPacket, MeshPacketCodec, Payload, Priority};
use crate::radio::RadioConfig;
use crate::registry::{NodeProfile, NodeRegistry};
use crate::transport::{ConnectionState, TransportId, TransportSession};

/// How often the read loop expires stale dedup entries
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Where an outbound packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every node on the channel
    Broadcast,
    /// A single node
    Node(u32),
}

impl Destination {
    /// Node number to put in the packet header
    pub fn node_num(&self) -> u32 {
        match self {
            Destination::Broadcast => BROADCAST_ADDR,
            Destination::Node(id) => *id,
        }
    }

    /// Check if this addresses every node
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl From<u32> for Destination {
    fn from(id: u32) -> Self {
        if id == 0 || id == BROADCAST_ADDR {
            Destination::Broadcast
        } else {
            Destination::Node(id)
        }
    }
}

/// Per-message send settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Wait for a routing acknowledgement
    pub want_ack: bool,
    /// Transmit priority
    pub priority: Priority,
    /// Channel index
    pub channel: u8,
    /// Hop limit override; the processor default otherwise
    pub hop_limit: Option<u8>,
    /// Packet this message replies to
    pub reply_id: Option<u32>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            want_ack: false,
            priority: Priority::DEFAULT,
            channel: 0,
            hop_limit: None,
            reply_id: None,
        }
    }
}

impl SendOptions {
    /// Acknowledged delivery at reliable priority
    pub fn reliable() -> Self {
        Self {
            want_ack: true,
            priority: Priority::RELIABLE,
            ..Default::default()
        }
    }
}

/// Processor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Complete frames that passed the CRC check
    pub frames_decoded: u64,
    /// Frames dropped for framing or CRC errors
    pub frame_errors: u64,
    /// Frame bodies or payloads that failed to decode
    pub decode_errors: u64,
    /// Packets blocked by deduplication
    pub duplicates_dropped: u64,
    /// Events published
    pub events_emitted: u64,
    /// Packets written to a transport
    pub packets_sent: u64,
    /// Positive acknowledgements matched to a send
    pub acks_received: u64,
    /// Negative acknowledgements matched to a send
    pub naks_received: u64,
}

type AckWaiter = oneshot::Sender<Result<(), SendError>>;

struct Inner {
    config: ProcessorConfig,
    codecs: Mutex<HashMap<TransportId, FrameCodec>>,
    dedup: DeduplicationCache,
    registry: NodeRegistry,
    events: broadcast::Sender<MeshEvent>,
    pending_acks: Mutex<HashMap<u32, AckWaiter>>,
    session: RwLock<Option<Arc<dyn TransportSession>>>,
    stats: Mutex<ProcessorStats>,
    next_id: AtomicU32,
}

/// Decodes inbound traffic and sends outbound messages.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MessageProcessor {
    inner: Arc<Inner>,
}

impl MessageProcessor {
    /// Create a processor with no attached session
    pub fn new(config: ProcessorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let dedup = DeduplicationCache::from_config(&config);
        let registry = NodeRegistry::new(config.node_offline_timeout);
        // Packet ids only need to be unique per sender within the dedup
        // window; a random start avoids colliding with a previous run.
        let first_id = rand::random::<u32>().max(1);

        Self {
            inner: Arc::new(Inner {
                config,
                codecs: Mutex::new(HashMap::new()),
                dedup,
                registry,
                events,
                pending_acks: Mutex::new(HashMap::new()),
                session: RwLock::new(None),
                stats: Mutex::new(ProcessorStats::default()),
                next_id: AtomicU32::new(first_id),
            }),
        }
    }

    /// Processor configuration
    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every known node
    pub fn get_nodes(&self) -> Vec<NodeProfile> {
        self.inner.registry.snapshot()
    }

    /// The node registry
    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// The deduplication cache
    pub fn dedup(&self) -> &DeduplicationCache {
        &self.inner.dedup
    }

    /// Current statistics
    pub fn stats(&self) -> ProcessorStats {
        self.inner.stats.lock().clone()
    }

    /// Check if a session is attached and up
    pub fn is_connected(&self) -> bool {
        self.inner
            .session
            .read()
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    fn bump(&self, f: impl FnOnce(&mut ProcessorStats)) {
        f(&mut self.inner.stats.lock());
    }

    fn emit(&self, event: MeshEvent) {
        trace!(kind = event.kind(), "Emitting event");
        self.bump(|s| s.events_emitted += 1);
        // No subscribers is not an error
        let _ = self.inner.events.send(event);
    }

    /// Feed bytes received on `transport`.
    ///
    /// Bytes may split frames anywhere; partial frames are kept per
    /// transport until the rest arrives. Framing and decode errors are
    /// logged and counted, never returned.
    pub fn on_bytes(&self, transport: &TransportId, bytes: &[u8]) {
        let frames: Vec<_> = {
            let mut codecs = self.inner.codecs.lock();
            let codec = codecs
                .entry(transport.clone())
                .or_insert_with(|| FrameCodec::with_max_packet_size(self.inner.config.max_packet_size));
            codec.feed(bytes).collect()
        };

        for frame in frames {
            match frame {
                Ok(body) => {
                    self.bump(|s| s.frames_decoded += 1);
                    self.handle_frame(transport, &body);
                }
                Err(e) => {
                    warn!(transport = %transport, error = %e, "Dropping bad frame");
                    self.bump(|s| s.frame_errors += 1);
                }
            }
        }
    }

    fn handle_frame(&self, transport: &TransportId, body: &[u8]) {
        let mut packet = match MeshPacketCodec::decode(body) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(transport = %transport, error = %e, "Failed to decode packet");
                self.bump(|s| s.decode_errors += 1);
                return;
            }
        };

        if !self.inner.dedup.should_process(packet.from, packet.id) {
            debug!(from = packet.from, id = packet.id, "Duplicate packet, skipping");
            self.bump(|s| s.duplicates_dropped += 1);
            return;
        }

        if packet.rx_time.is_none() {
            packet.rx_time = Some(Utc::now());
        }
        self.inner.registry.observe(&packet);

        let data = match &packet.payload {
            Payload::Decoded(data) => data.clone(),
            Payload::Encrypted(_) => {
                debug!(from = packet.from, id = packet.id, "Encrypted packet");
                self.emit(MeshEvent::PacketReceived {
                    transport: transport.clone(),
                    packet,
                });
                return;
            }
        };

        let transport = transport.clone();
        let from = packet.from;
        match data.content() {
            Ok(MessageContent::Text(text)) => {
                info!(from, id = packet.id, len = text.len(), "Text message received");
                self.emit(MeshEvent::MessageReceived {
                    transport,
                    packet,
                    text,
                });
            }
            Ok(MessageContent::Position(position)) => {
                let profile = self.inner.registry.update_position(from, position.clone());
                self.emit(MeshEvent::NodeUpdated(profile));
                self.emit(MeshEvent::PositionReceived {
                    transport,
                    packet,
                    position,
                });
            }
            Ok(MessageContent::NodeInfo(user)) => {
                let profile = self.inner.registry.update_user(from, user);
                self.emit(MeshEvent::NodeUpdated(profile));
            }
            Ok(MessageContent::Telemetry(telemetry)) => {
                let profile = self.inner.registry.update_telemetry(from, &telemetry);
                self.emit(MeshEvent::NodeUpdated(profile));
                self.emit(MeshEvent::TelemetryReceived {
                    transport,
                    packet,
                    telemetry,
                });
            }
            Ok(MessageContent::Waypoint(waypoint)) => {
                self.emit(MeshEvent::WaypointReceived {
                    transport,
                    packet,
                    waypoint,
                });
            }
            Ok(MessageContent::Admin(payload)) => {
                self.emit(MeshEvent::AdminReceived {
                    transport,
                    packet,
                    payload,
                });
            }
            Ok(MessageContent::Routing(routing)) => {
                if let Some(request_id) = data.request_id {
                    self.resolve_ack(request_id, &routing);
                }
                self.emit(MeshEvent::RoutingReceived {
                    transport,
                    packet,
                    routing,
                });
            }
            Ok(MessageContent::Raw { .. }) => {
                self.emit(MeshEvent::PacketReceived { transport, packet });
            }
            Err(error) => {
                warn!(from, id = packet.id, error = %error, "Payload rejected");
                self.bump(|s| s.decode_errors += 1);
                self.emit(MeshEvent::PayloadRejected {
                    transport,
                    packet,
                    error,
                });
            }
        }
    }

    fn resolve_ack(&self, request_id: u32, routing: &Routing) {
        let result = match routing {
            Routing::Error { reason } if routing.is_ack() => {
                trace!(request_id, reason, "Ack");
                Ok(())
            }
            Routing::Error { reason } => Err(SendError::Nak {
                packet_id: request_id,
                error_reason: *reason,
            }),
            Routing::RouteRequest(_) | Routing::RouteReply(_) => return,
        };

        let Some(waiter) = self.inner.pending_acks.lock().remove(&request_id) else {
            return;
        };
        match &result {
            Ok(()) => self.bump(|s| s.acks_received += 1),
            Err(_) => self.bump(|s| s.naks_received += 1),
        }
        debug!(request_id, acked = result.is_ok(), "Delivery report matched");
        let _ = waiter.send(result);
    }

    /// Make `session` the active transport and start reading from it.
    ///
    /// Any previously attached session is replaced but not closed. The
    /// returned task ends when the session is closed or its link is lost.
    pub fn attach(&self, session: Arc<dyn TransportSession>) -> JoinHandle<()> {
        let transport = session.id();
        info!(transport = %transport, kind = %session.kind(), "Session attached");
        *self.inner.session.write() = Some(session.clone());
        self.emit(MeshEvent::ConnectionChanged {
            transport,
            state: ConnectionState::Connected,
            reason: None,
        });

        let processor = self.clone();
        tokio::spawn(async move { processor.read_loop(session).await })
    }

    /// Close the active session, if any
    pub async fn detach(&self) {
        let session = self.inner.session.read().clone();
        if let Some(session) = session {
            info!(transport = %session.id(), "Detaching session");
            session.close().await;
            self.session_ended(&session.id(), "closed locally".to_string());
        }
    }

    async fn read_loop(&self, session: Arc<dyn TransportSession>) {
        let transport = session.id();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.tick().await;

        loop {
            tokio::select! {
                result = session.recv() => match result {
                    Ok(bytes) => {
                        trace!(transport = %transport, bytes = bytes.len(), "Received");
                        self.on_bytes(&transport, &bytes);
                    }
                    Err(TransportError::Closed) => {
                        debug!(transport = %transport, "Session closed");
                        self.session_ended(&transport, "closed locally".to_string());
                        return;
                    }
                    Err(e) => {
                        warn!(transport = %transport, error = %e, "Transport lost");
                        // Release the port or peripheral now rather than on last drop
                        session.close().await;
                        self.session_ended(&transport, e.to_string());
                        return;
                    }
                },
                _ = housekeeping.tick() => {
                    let expired = self.inner.dedup.expire_old_entries();
                    if expired > 0 {
                        trace!(expired, "Expired dedup entries");
                    }
                }
            }
        }
    }

    /// Forget everything tied to a session that went away: its partial
    /// frame, the dedup window, the registry and every outstanding ack.
    fn session_ended(&self, transport: &TransportId, reason: String) {
        self.inner.codecs.lock().remove(transport);

        let was_active = {
            let mut active = self.inner.session.write();
            match active.as_ref() {
                Some(s) if &s.id() == transport => {
                    active.take();
                    true
                }
                _ => false,
            }
        };
        if !was_active {
            return;
        }

        let waiters: Vec<AckWaiter> = self
            .inner
            .pending_acks
            .lock()
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(SendError::Cancelled));
        }
        self.inner.dedup.clear();
        self.inner.registry.clear();

        info!(transport = %transport, reason = %reason, "Session ended");
        self.emit(MeshEvent::ConnectionChanged {
            transport: transport.clone(),
            state: ConnectionState::Disconnected,
            reason: Some(reason),
        });
    }

    fn next_packet_id(&self) -> u32 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a text message.
    ///
    /// Direct messages wait for an acknowledgement, broadcasts do not.
    /// Returns the packet id.
    pub async fn send_text(
        &self,
        dest: Destination,
        text: &str,
        priority: Priority,
    ) -> Result<u32, SendError> {
        let options = SendOptions {
            want_ack: !dest.is_broadcast(),
            priority,
            ..Default::default()
        };
        self.send_text_with(dest, text, options).await
    }

    /// Send a text message with explicit options
    pub async fn send_text_with(
        &self,
        dest: Destination,
        text: &str,
        options: SendOptions,
    ) -> Result<u32, SendError> {
        self.send(dest, &MessageContent::Text(text.to_string()), options)
            .await
    }

    /// Send any content.
    ///
    /// Resolves once the frame is written, or when `want_ack` is set, once
    /// the destination acknowledged it, rejected it or the ack timeout
    /// passed.
    pub async fn send(
        &self,
        dest: Destination,
        content: &MessageContent,
        options: SendOptions,
    ) -> Result<u32, SendError> {
        let session = self
            .inner
            .session
            .read()
            .clone()
            .ok_or(SendError::NotConnected)?;

        let mut data = Data::from_content(content);
        if data.payload.len() > LORA_MAX_PAYLOAD {
            return Err(SendError::PayloadTooLarge {
                size: data.payload.len(),
                max: LORA_MAX_PAYLOAD,
            });
        }
        data.reply_id = options.reply_id;

        let id = self.next_packet_id();
        let local = self.inner.config.local_node_id;
        let mut packet = MeshPacket::new(local, dest.node_num(), id, Payload::Decoded(data));
        packet.want_ack = options.want_ack;
        packet.priority = options.priority;
        packet.channel = options.channel;
        packet.hop_limit = options
            .hop_limit
            .unwrap_or(self.inner.config.hop_limit)
            .min(MAX_HOP_LIMIT);

        let body = MeshPacketCodec::encode(&packet);
        if body.len() > self.inner.config.max_packet_size {
            return Err(SendError::PayloadTooLarge {
                size: body.len(),
                max: self.inner.config.max_packet_size,
            });
        }
        let frame = FrameCodec::encode(&body);

        // The radio echoes what we send
        self.inner.dedup.mark_processed(local, id);

        let waiter = options.want_ack.then(|| {
            let (tx, rx) = oneshot::channel();
            self.inner.pending_acks.lock().insert(id, tx);
            rx
        });

        if let Err(e) = session.write(&frame).await {
            self.inner.pending_acks.lock().remove(&id);
            warn!(id, error = %e, "Send failed");
            return Err(e.into());
        }
        self.bump(|s| s.packets_sent += 1);
        debug!(
            id,
            to = packet.to,
            size = frame.len(),
            want_ack = options.want_ack,
            "Packet sent"
        );

        let Some(rx) = waiter else {
            return Ok(id);
        };

        let ack_timeout = self.inner.config.ack_timeout;
        match tokio::time::timeout(ack_timeout, rx).await {
            Ok(Ok(result)) => result.map(|()| id),
            Ok(Err(_)) => Err(SendError::Cancelled),
            Err(_) => {
                self.inner.pending_acks.lock().remove(&id);
                warn!(id, "No acknowledgement");
                Err(SendError::AckTimeout {
                    packet_id: id,
                    duration_ms: ack_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Push `config` to the local radio.
    ///
    /// The config is validated first; a rejected config is never sent. The
    /// admin request goes to the local node with `want_ack`, so this
    /// resolves once the radio acknowledged it. Returns the packet id.
    pub async fn apply_radio_config(&self, config: &RadioConfig) -> Result<u32, LoraCommsError> {
        config.validate()?;
        let local = self.inner.config.local_node_id;
        info!(
            region = %config.region,
            preset = ?config.preset,
            tx_power = config.tx_power,
            "Applying radio config"
        );
        let content = MessageContent::Admin(config.to_admin_payload());
        let id = self
            .send(Destination::Node(local), &content, SendOptions::reliable())
            .await?;
        Ok(id)
    }

    /// Number of sends waiting for an acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.inner.pending_acks.lock().len()
    }
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("local_node_id", &self.inner.config.local_node_id)
            .field("nodes", &self.inner.registry.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Position, UserInfo};
    use crate::test_utils::{
        ack_packet, encode_frame, nak_packet, packet_with, text_packet, MockTransport,
    };
    use bytes::Bytes;

    const LOCAL: u32 = 0x0000_0001;

    fn processor() -> MessageProcessor {
        MessageProcessor::new(ProcessorConfig {
            local_node_id: LOCAL,
            ack_timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    fn drain(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_destination() {
        assert_eq!(Destination::Broadcast.node_num(), BROADCAST_ADDR);
        assert_eq!(Destination::Node(42).node_num(), 42);
        assert_eq!(Destination::from(0), Destination::Broadcast);
        assert_eq!(Destination::from(BROADCAST_ADDR), Destination::Broadcast);
        assert_eq!(Destination::from(7), Destination::Node(7));
    }

    #[tokio::test]
    async fn test_text_message_emits_event() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let transport = TransportId::from("test");

        processor.on_bytes(&transport, &encode_frame(&text_packet(100, 0, 7, "hello mesh")));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::MessageReceived { text, packet, .. } => {
                assert_eq!(text, "hello mesh");
                assert_eq!(packet.from, 100);
                assert!(packet.is_broadcast());
                assert!(packet.rx_time.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(processor.get_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_is_dropped() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let transport = TransportId::from("test");
        let frame = encode_frame(&text_packet(100, 0, 7, "once"));

        processor.on_bytes(&transport, &frame);
        processor.on_bytes(&transport, &frame);

        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(processor.stats().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_partial_frames_per_transport() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let a = TransportId::from("a");
        let b = TransportId::from("b");
        let frame_a = encode_frame(&text_packet(1, 0, 1, "from a"));
        let frame_b = encode_frame(&text_packet(2, 0, 1, "from b"));
        let (a1, a2) = frame_a.split_at(5);
        let (b1, b2) = frame_b.split_at(7);

        processor.on_bytes(&a, a1);
        processor.on_bytes(&b, b1);
        assert!(drain(&mut rx).is_empty());
        processor.on_bytes(&a, a2);
        processor.on_bytes(&b, b2);

        let texts: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                MeshEvent::MessageReceived { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["from a", "from b"]);
    }

    #[tokio::test]
    async fn test_bad_crc_is_counted() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let mut frame = encode_frame(&text_packet(1, 0, 1, "corrupt")).to_vec();
        frame[3] ^= 0x01;

        processor.on_bytes(&TransportId::from("t"), &frame);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(processor.stats().frame_errors, 1);
    }

    #[tokio::test]
    async fn test_node_info_updates_registry() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let user = UserInfo {
            short_name: "ALFA".into(),
            long_name: "Alfa Base".into(),
            ..Default::default()
        };
        let packet = packet_with(0x1234, BROADCAST_ADDR, 9, &MessageContent::NodeInfo(user));

        processor.on_bytes(&TransportId::from("t"), &encode_frame(&packet));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::NodeUpdated(profile) => {
                assert_eq!(profile.node_id, 0x1234);
                assert_eq!(profile.short_name(), Some("ALFA"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_position_emits_node_and_position() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let position = Position {
            latitude: Some(52.5),
            longitude: Some(13.4),
            ..Default::default()
        };
        let packet = packet_with(0x42, BROADCAST_ADDR, 3, &MessageContent::Position(position));

        processor.on_bytes(&TransportId::from("t"), &encode_frame(&packet));

        let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["node", "position"]);
        let node = processor.registry().get(0x42).unwrap();
        assert!(node.position.is_some());
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_rejected() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let content = MessageContent::Raw {
            portnum: crate::content::PortNum::Position,
            payload: Bytes::from_static(&[0xFF, 0xFF, 0xFF]),
        };
        let packet = packet_with(5, BROADCAST_ADDR, 1, &content);

        processor.on_bytes(&TransportId::from("t"), &encode_frame(&packet));

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [MeshEvent::PayloadRejected { .. }]));
        assert_eq!(processor.stats().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let processor = processor();
        let err = processor
            .send_text(Destination::Broadcast, "hi", Priority::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_broadcast_send_writes_frame() {
        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());

        let id = processor
            .send_text(Destination::Broadcast, "hello", Priority::DEFAULT)
            .await
            .unwrap();

        let sent = transport.written_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, id);
        assert_eq!(sent[0].from, LOCAL);
        assert_eq!(sent[0].to, BROADCAST_ADDR);
        assert!(!sent[0].want_ack);
        assert_eq!(processor.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_echo_is_suppressed() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());
        drain(&mut rx);

        processor
            .send_text(Destination::Broadcast, "echo", Priority::DEFAULT)
            .await
            .unwrap();
        let frame = transport.written()[0].clone();
        processor.on_bytes(&transport.id(), &frame);

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());

        let text = "x".repeat(LORA_MAX_PAYLOAD + 1);
        let err = processor
            .send_text(Destination::Broadcast, &text, Priority::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::PayloadTooLarge { size, .. } if size == LORA_MAX_PAYLOAD + 1));
        assert!(transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_direct_send_resolves_on_ack() {
        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());

        let sender = processor.clone();
        let send = tokio::spawn(async move {
            sender
                .send_text(Destination::Node(99), "ping", Priority::DEFAULT)
                .await
        });

        transport.wait_for_writes(1).await;
        let sent = transport.written_packets();
        assert!(sent[0].want_ack);
        transport.push(encode_frame(&ack_packet(99, LOCAL, 500, sent[0].id)));

        assert_eq!(send.await.unwrap().unwrap(), sent[0].id);
        assert_eq!(processor.stats().acks_received, 1);
        assert_eq!(processor.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_direct_send_fails_on_nak() {
        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());

        let sender = processor.clone();
        let send = tokio::spawn(async move {
            sender
                .send_text(Destination::Node(99), "ping", Priority::DEFAULT)
                .await
        });

        transport.wait_for_writes(1).await;
        let id = transport.written_packets()[0].id;
        transport.push(encode_frame(&nak_packet(99, LOCAL, 501, id, 5)));

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, SendError::Nak { packet_id, error_reason: 5 } if packet_id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());

        let err = processor
            .send_text(Destination::Node(99), "anyone?", Priority::DEFAULT)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::AckTimeout { duration_ms: 5000, .. }));
        assert_eq!(processor.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_detach_cancels_pending_acks() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let transport = Arc::new(MockTransport::new("mock"));
        let reader = processor.attach(transport.clone());

        let sender = processor.clone();
        let send = tokio::spawn(async move {
            sender
                .send_text(Destination::Node(99), "bye", Priority::DEFAULT)
                .await
        });
        transport.wait_for_writes(1).await;

        processor.detach().await;
        assert!(matches!(send.await.unwrap(), Err(SendError::Cancelled)));
        reader.await.unwrap();

        let last = drain(&mut rx).pop().unwrap();
        assert!(matches!(
            last,
            MeshEvent::ConnectionChanged {
                state: ConnectionState::Disconnected,
                ..
            }
        ));
        assert!(!processor.is_connected());
    }

    #[tokio::test]
    async fn test_transport_loss_clears_session_state() {
        let processor = processor();
        let mut rx = processor.subscribe();
        let transport = Arc::new(MockTransport::new("mock"));
        let reader = processor.attach(transport.clone());

        transport.push(encode_frame(&text_packet(100, 0, 7, "before")));
        transport.fail(TransportError::Disconnected("cable pulled".into()));
        reader.await.unwrap();

        let events = drain(&mut rx);
        match events.last() {
            Some(MeshEvent::ConnectionChanged { state, reason, .. }) => {
                assert_eq!(*state, ConnectionState::Disconnected);
                assert!(reason.as_deref().unwrap().contains("cable pulled"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(processor.get_nodes().is_empty());
        assert!(processor.dedup().is_empty());
        assert!(!transport.is_connected(), "lost session was not closed");
    }

    #[tokio::test]
    async fn test_apply_radio_config_sends_admin_to_local_node() {
        use crate::proto;
        use crate::radio::{ModemPreset, Region};
        use prost::Message;

        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());
        let config = RadioConfig::for_region(Region::EU868).with_preset(ModemPreset::MediumSlow);

        let sender = processor.clone();
        let radio = config.clone();
        let apply = tokio::spawn(async move { sender.apply_radio_config(&radio).await });

        transport.wait_for_writes(1).await;
        let sent = transport.written_packets();
        assert_eq!(sent[0].to, LOCAL);
        assert!(sent[0].want_ack);
        assert_eq!(sent[0].priority, Priority::RELIABLE);
        let payload = match sent[0].decoded().unwrap().content().unwrap() {
            MessageContent::Admin(payload) => payload,
            other => panic!("unexpected content: {other:?}"),
        };
        let lora = proto::AdminMessage::decode(payload)
            .unwrap()
            .set_config
            .unwrap()
            .lora
            .unwrap();
        assert_eq!(lora.region, Region::EU868.region_code());
        assert_eq!(lora.spread_factor, 10);

        transport.push(encode_frame(&ack_packet(LOCAL, LOCAL, 77, sent[0].id)));
        assert_eq!(apply.await.unwrap().unwrap(), sent[0].id);
    }

    #[tokio::test]
    async fn test_apply_radio_config_rejects_invalid() {
        use crate::error::{ConfigError, LoraCommsError};
        use crate::radio::Region;

        let processor = processor();
        let transport = Arc::new(MockTransport::new("mock"));
        let _reader = processor.attach(transport.clone());
        let config = RadioConfig::for_region(Region::JP).with_tx_power(20);

        let err = processor.apply_radio_config(&config).await.unwrap_err();
        assert!(matches!(
            err,
            LoraCommsError::Config(ConfigError::TxPowerTooHigh { max_dbm: 13, .. })
        ));
        assert!(transport.written().is_empty());
    }
}
