use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use super::bitfield::Bitfield;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use super::peer_id::PeerId;
use crate::constants::{BLOCK_SIZE, KEEP_ALIVE_INTERVAL};
use crate::storage::PieceStore;

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A block the remote asked us to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub addr: SocketAddr,
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// A block payload the remote delivered to us.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub addr: SocketAddr,
    pub piece: u32,
    pub block: u32,
    pub data: Bytes,
}

/// Everything a peer session reports to the controller.
///
/// Choke, interest, have and bitfield changes all funnel into
/// `StateChanged` so the controller re-runs scheduling; the block events
/// feed its queues.
#[derive(Debug)]
pub enum PeerEvent {
    StateChanged { addr: SocketAddr },
    BlockRequested(BlockRequest),
    BlockCancelled(BlockRequest),
    BlockReceived(BlockData),
    Disconnected { addr: SocketAddr },
}

pub type EventSender = UnboundedSender<PeerEvent>;

/// Scheduling-relevant view of one peer, copied out under its lock.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub has: Vec<bool>,
    pub requested: Vec<Vec<bool>>,
}

struct State {
    handshake_sent: bool,
    handshake_received: bool,
    /// We refuse to upload to them. Starts true.
    am_choking: bool,
    /// They refuse to upload to us. Starts true.
    peer_choking: bool,
    am_interested: bool,
    peer_interested: bool,
    remote_has: Bitfield,
    /// Blocks we have asked this peer for.
    requested: Vec<Vec<bool>>,
    last_active: Instant,
    last_keep_alive: Option<Instant>,
    peer_id: Option<PeerId>,
    uploaded: u64,
    downloaded: u64,
}

/// One connection to a remote peer.
///
/// Owns the socket (split between a reader and a writer task) and its read
/// buffer. Sends are enqueued on an unbounded channel so the controller's
/// loops never block on a slow peer. All protocol state sits behind one
/// mutex and is only held for short, non-awaiting sections.
pub struct Peer {
    addr: SocketAddr,
    store: Arc<PieceStore>,
    local_id: PeerId,
    state: Mutex<State>,
    outbound: UnboundedSender<Message>,
    events: EventSender,
    disconnected: AtomicBool,
    shutdown: Notify,
}

impl Peer {
    /// Creates a session for an outbound connection and starts connecting in
    /// the background. The returned handle is live immediately; a failed
    /// connect surfaces as a `Disconnected` event.
    pub fn connect(
        addr: SocketAddr,
        store: Arc<PieceStore>,
        local_id: PeerId,
        events: EventSender,
    ) -> Arc<Self> {
        let (peer, outbound_rx) = Self::new(addr, store, local_id, events);
        tokio::spawn(peer.clone().run(None, outbound_rx));
        peer
    }

    /// Creates a session for an accepted inbound connection.
    pub fn accept(
        stream: TcpStream,
        store: Arc<PieceStore>,
        local_id: PeerId,
        events: EventSender,
    ) -> std::io::Result<Arc<Self>> {
        let addr = stream.peer_addr()?;
        let (peer, outbound_rx) = Self::new(addr, store, local_id, events);
        tokio::spawn(peer.clone().run(Some(stream), outbound_rx));
        Ok(peer)
    }

    fn new(
        addr: SocketAddr,
        store: Arc<PieceStore>,
        local_id: PeerId,
        events: EventSender,
    ) -> (Arc<Self>, UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let piece_count = store.piece_count();
        let requested = (0..piece_count as u32)
            .map(|p| vec![false; store.block_count(p) as usize])
            .collect();

        let peer = Arc::new(Self {
            addr,
            local_id,
            state: Mutex::new(State {
                handshake_sent: false,
                handshake_received: false,
                am_choking: true,
                peer_choking: true,
                am_interested: false,
                peer_interested: false,
                remote_has: Bitfield::new(piece_count),
                requested,
                last_active: Instant::now(),
                last_keep_alive: None,
                peer_id: None,
                uploaded: 0,
                downloaded: 0,
            }),
            store,
            outbound,
            events,
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        (peer, outbound_rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tears the connection down. Idempotent; emits `Disconnected` once.
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            tracing::debug!(addr = %self.addr, "peer disconnected");
            self.shutdown.notify_waiters();
            let _ = self.events.send(PeerEvent::Disconnected { addr: self.addr });
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_handshake_complete(&self) -> bool {
        let state = self.state.lock();
        state.handshake_sent && state.handshake_received
    }

    pub fn handshake_received(&self) -> bool {
        self.state.lock().handshake_received
    }

    pub fn is_peer_choking(&self) -> bool {
        self.state.lock().peer_choking
    }

    pub fn is_peer_interested(&self) -> bool {
        self.state.lock().peer_interested
    }

    pub fn am_choking(&self) -> bool {
        self.state.lock().am_choking
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.state.lock().peer_id
    }

    pub fn last_active(&self) -> Instant {
        self.state.lock().last_active
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.state.lock().remote_has.has(piece as usize)
    }

    /// Whether the remote has every piece of the torrent.
    pub fn is_complete(&self) -> bool {
        self.state.lock().remote_has.is_complete()
    }

    /// How many pieces the remote has that are not in `verified`.
    pub fn pieces_required(&self, verified: &[bool]) -> usize {
        let state = self.state.lock();
        verified
            .iter()
            .enumerate()
            .filter(|&(i, &v)| !v && state.remote_has.has(i))
            .count()
    }

    /// Outstanding block requests to this peer.
    pub fn blocks_requested(&self) -> usize {
        let state = self.state.lock();
        state
            .requested
            .iter()
            .map(|blocks| blocks.iter().filter(|&&b| b).count())
            .sum()
    }

    /// Clears the requested flag for one block, returning whether it was set.
    pub fn clear_requested(&self, piece: u32, block: u32) -> bool {
        let mut state = self.state.lock();
        match state
            .requested
            .get_mut(piece as usize)
            .and_then(|blocks| blocks.get_mut(block as usize))
        {
            Some(flag) => std::mem::replace(flag, false),
            None => false,
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.lock();
        PeerSnapshot {
            addr: self.addr,
            has: state.remote_has.flags(),
            requested: state.requested.clone(),
        }
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.state.lock().uploaded
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.state.lock().downloaded
    }

    // --- sends -------------------------------------------------------------
    //
    // All sends enqueue; the writer task does the socket work. The guarded
    // ones only transmit on an actual state change.

    pub fn send_interested(&self) {
        let mut state = self.state.lock();
        if state.am_interested {
            return;
        }
        state.am_interested = true;
        drop(state);
        self.enqueue(Message::Interested);
    }

    pub fn send_not_interested(&self) {
        let mut state = self.state.lock();
        if !state.am_interested {
            return;
        }
        state.am_interested = false;
        drop(state);
        self.enqueue(Message::NotInterested);
    }

    pub fn send_unchoke(&self) {
        let mut state = self.state.lock();
        if !state.am_choking {
            return;
        }
        state.am_choking = false;
        drop(state);
        self.enqueue(Message::Unchoke);
    }

    /// Sends a keep-alive unless one went out in the last 30 seconds.
    pub fn send_keep_alive(&self) {
        let mut state = self.state.lock();
        if state
            .last_keep_alive
            .is_some_and(|at| at.elapsed() < KEEP_ALIVE_INTERVAL)
        {
            return;
        }
        state.last_keep_alive = Some(Instant::now());
        drop(state);
        self.enqueue(Message::KeepAlive);
    }

    pub fn send_have(&self, piece: u32) {
        self.enqueue(Message::Have { piece });
    }

    /// Requests a block and marks it outstanding.
    pub fn send_request(&self, piece: u32, begin: u32, length: u32) {
        let block = begin / BLOCK_SIZE;
        {
            let mut state = self.state.lock();
            if let Some(flag) = state
                .requested
                .get_mut(piece as usize)
                .and_then(|blocks| blocks.get_mut(block as usize))
            {
                *flag = true;
            }
        }
        self.enqueue(Message::Request {
            index: piece,
            begin,
            length,
        });
    }

    pub fn send_cancel(&self, piece: u32, begin: u32, length: u32) {
        self.enqueue(Message::Cancel {
            index: piece,
            begin,
            length,
        });
    }

    pub fn send_piece(&self, piece: u32, begin: u32, data: Bytes) {
        self.state.lock().uploaded += data.len() as u64;
        self.enqueue(Message::Piece {
            index: piece,
            begin,
            data,
        });
    }

    fn enqueue(&self, message: Message) {
        // Receiver only goes away on disconnect; losing the message then is
        // the desired behavior.
        let _ = self.outbound.send(message);
    }

    // --- socket tasks ------------------------------------------------------

    async fn run(
        self: Arc<Self>,
        stream: Option<TcpStream>,
        outbound_rx: UnboundedReceiver<Message>,
    ) {
        let stream = match stream {
            Some(stream) => stream,
            None => match TcpStream::connect(self.addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(addr = %self.addr, error = %e, "connect failed");
                    self.disconnect();
                    return;
                }
            },
        };

        if self.is_disconnected() {
            return;
        }

        tracing::debug!(addr = %self.addr, "peer connected");

        let (read_half, mut write_half) = stream.into_split();

        // Handshake goes out first, before the writer task takes over the
        // write half.
        let handshake = Handshake::new(*self.store.info_hash().as_bytes(), self.local_id.0);
        if write_half.write_all(&handshake.encode()).await.is_err() {
            self.disconnect();
            return;
        }
        self.state.lock().handshake_sent = true;

        let writer = self.clone();
        tokio::spawn(writer.write_loop(write_half, outbound_rx));

        self.read_loop(read_half).await;
        self.disconnect();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut outbound_rx: UnboundedReceiver<Message>,
    ) {
        loop {
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);

            if self.is_disconnected() {
                return;
            }

            tokio::select! {
                _ = &mut shutdown => return,
                message = outbound_rx.recv() => {
                    let Some(message) = message else { return };
                    if write_half.write_all(&message.encode()).await.is_err() {
                        self.disconnect();
                        return;
                    }
                }
            }
        }
    }

    async fn read_loop(self: &Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = BytesMut::with_capacity(32 * 1024);

        loop {
            // Drain every complete frame already buffered before reading
            // more from the socket.
            loop {
                let handshake_received = self.state.lock().handshake_received;
                let Some(frame_len) = frame_length(&buf, handshake_received) else {
                    break;
                };

                if frame_len > MAX_FRAME_BYTES {
                    tracing::warn!(addr = %self.addr, frame_len, "oversized frame");
                    return;
                }
                if buf.len() < frame_len {
                    break;
                }

                let frame = buf.split_to(frame_len).freeze();
                if !self.handle_frame(frame) {
                    return;
                }
            }

            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);

            if self.is_disconnected() {
                return;
            }

            tokio::select! {
                _ = &mut shutdown => return,
                read = read_half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            }
        }
    }

    /// Processes one complete frame. Returns false when the connection must
    /// be dropped: the protocol has no recovery path for desync.
    fn handle_frame(self: &Arc<Self>, frame: Bytes) -> bool {
        self.state.lock().last_active = Instant::now();

        if !self.state.lock().handshake_received {
            return self.handle_handshake(&frame);
        }

        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "bad frame");
                return false;
            }
        };

        match message {
            Message::KeepAlive => {
                tracing::trace!(addr = %self.addr, "<- keep-alive");
            }
            Message::Choke => {
                self.state.lock().peer_choking = true;
                self.emit_state_changed();
            }
            Message::Unchoke => {
                self.state.lock().peer_choking = false;
                self.emit_state_changed();
            }
            Message::Interested => {
                self.state.lock().peer_interested = true;
                self.emit_state_changed();
            }
            Message::NotInterested => {
                self.state.lock().peer_interested = false;
                self.emit_state_changed();
            }
            Message::Have { piece } => {
                if piece as usize >= self.store.piece_count() {
                    tracing::warn!(addr = %self.addr, piece, "have out of range");
                    return false;
                }
                self.state.lock().remote_has.set(piece as usize);
                self.emit_state_changed();
            }
            Message::Bitfield(bytes) => {
                if bytes.len() != Bitfield::byte_len(self.store.piece_count()) {
                    tracing::warn!(addr = %self.addr, "bitfield length mismatch");
                    return false;
                }
                let incoming = Bitfield::from_bytes(&bytes, self.store.piece_count());
                self.state.lock().remote_has.merge(&incoming);
                self.emit_state_changed();
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                let _ = self.events.send(PeerEvent::BlockRequested(BlockRequest {
                    addr: self.addr,
                    piece: index,
                    begin,
                    length,
                }));
            }
            Message::Piece { index, begin, data } => {
                self.state.lock().downloaded += data.len() as u64;
                let _ = self.events.send(PeerEvent::BlockReceived(BlockData {
                    addr: self.addr,
                    piece: index,
                    block: begin / BLOCK_SIZE,
                    data,
                }));
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let _ = self.events.send(PeerEvent::BlockCancelled(BlockRequest {
                    addr: self.addr,
                    piece: index,
                    begin,
                    length,
                }));
            }
            Message::Port(port) => {
                tracing::trace!(addr = %self.addr, port, "<- port (ignored)");
            }
        }

        true
    }

    fn handle_handshake(self: &Arc<Self>, frame: &[u8]) -> bool {
        let handshake = match Handshake::decode(frame) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "bad handshake");
                return false;
            }
        };

        if &handshake.info_hash != self.store.info_hash().as_bytes() {
            tracing::warn!(
                addr = %self.addr,
                theirs = %hex(&handshake.info_hash),
                ours = %self.store.info_hash(),
                "handshake for wrong torrent"
            );
            return false;
        }

        {
            let mut state = self.state.lock();
            state.peer_id = PeerId::from_bytes(&handshake.peer_id);
            state.handshake_received = true;
        }

        tracing::debug!(addr = %self.addr, "handshake complete");
        self.enqueue(Message::Bitfield(
            Bitfield::from_flags(&self.store.verified_flags()).to_bytes(),
        ));

        true
    }

    fn emit_state_changed(&self) {
        let _ = self
            .events
            .send(PeerEvent::StateChanged { addr: self.addr });
    }
}

/// Length of the next frame in the buffer, or `None` when the length prefix
/// itself is still incomplete. Until the handshake arrives the frame size is
/// the fixed 68 bytes; after that the 4-byte prefix governs.
pub(crate) fn frame_length(buf: &[u8], handshake_received: bool) -> Option<usize> {
    if !handshake_received {
        return Some(HANDSHAKE_LEN);
    }
    if buf.len() < 4 {
        return None;
    }
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some(4 + declared)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}
