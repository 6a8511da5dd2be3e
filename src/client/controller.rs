use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as LoopGuard;
use tokio::task::JoinHandle;

use super::error::ClientError;
use super::queues::{IncomingQueue, OutgoingQueue};
use super::{resume, scheduler};
use crate::constants::{
    DEFAULT_MAX_DOWNLOAD_BYTES_PER_SEC, DEFAULT_MAX_LEECHERS, DEFAULT_MAX_SEEDERS,
    DEFAULT_MAX_UPLOAD_BYTES_PER_SEC, DOWNLOAD_LOOP_INTERVAL, PEER_LOOP_INTERVAL, PEER_TIMEOUT,
    THROTTLE_WINDOW, TRACKER_LOOP_INTERVAL, UPLOAD_LOOP_INTERVAL,
};
use crate::metainfo::Metainfo;
use crate::peer::{BlockData, Peer, PeerEvent, PeerId, PeerSnapshot};
use crate::storage::{PieceStore, VerifyOutcome};
use crate::throttle::Throttle;
use crate::tracker::{AnnounceRequest, Tracker, TrackerEvent};

/// Per-peer counters for the embedding program.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    /// Bytes received from this peer inside the current throttle window.
    pub download_rate: u64,
    /// Bytes sent to this peer inside the current throttle window.
    pub upload_rate: u64,
}

/// Guards making each periodic loop self-excluding: a tick that finds its
/// guard taken is dropped, not queued. The next tick re-converges.
#[derive(Default)]
struct LoopGuards {
    peers: LoopGuard<()>,
    uploads: LoopGuard<()>,
    downloads: LoopGuard<()>,
}

/// One torrent session: all peers, queues, throttles and scheduling.
pub struct Client {
    port: AtomicU16,
    peer_id: PeerId,
    store: Arc<PieceStore>,
    trackers: Vec<Arc<Tracker>>,

    peers: DashMap<SocketAddr, Arc<Peer>>,
    /// Peers we treat as upload sources.
    seeders: DashSet<SocketAddr>,
    /// Peers we upload to.
    leechers: DashSet<SocketAddr>,
    max_seeders: AtomicUsize,
    max_leechers: AtomicUsize,

    upload_throttle: Throttle,
    download_throttle: Throttle,
    outgoing: OutgoingQueue,
    incoming: IncomingQueue,

    guards: LoopGuards,
    rng: Mutex<StdRng>,

    events_tx: UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<PeerEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Client {
    /// Builds a session from a descriptor and a download directory.
    ///
    /// Parses the descriptor (the only globally fatal failure), re-hashes
    /// existing on-disk data, and writes the resume sidecar next to the
    /// descriptor. The session does no networking until [`Client::start`].
    pub async fn new(
        port: u16,
        torrent_path: impl AsRef<Path>,
        download_dir: impl AsRef<Path>,
    ) -> Result<Arc<Self>, ClientError> {
        let torrent_path = torrent_path.as_ref();
        let download_dir = download_dir.as_ref();

        let metainfo = Metainfo::from_file(torrent_path)?;
        let store = Arc::new(PieceStore::open(&metainfo, download_dir).await?);

        let trackers: Vec<Arc<Tracker>> = metainfo
            .trackers
            .iter()
            .map(|url| Arc::new(Tracker::new(url.clone())))
            .collect();

        if trackers.is_empty() {
            tracing::warn!(name = %store.name(), "descriptor lists no trackers");
        }

        resume::write_record(torrent_path, download_dir)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            port: AtomicU16::new(port),
            peer_id: PeerId::generate(),
            store,
            trackers,
            peers: DashMap::new(),
            seeders: DashSet::new(),
            leechers: DashSet::new(),
            max_seeders: AtomicUsize::new(DEFAULT_MAX_SEEDERS),
            max_leechers: AtomicUsize::new(DEFAULT_MAX_LEECHERS),
            upload_throttle: Throttle::new(DEFAULT_MAX_UPLOAD_BYTES_PER_SEC, THROTTLE_WINDOW),
            download_throttle: Throttle::new(DEFAULT_MAX_DOWNLOAD_BYTES_PER_SEC, THROTTLE_WINDOW),
            outgoing: OutgoingQueue::default(),
            incoming: IncomingQueue::default(),
            guards: LoopGuards::default(),
            rng: Mutex::new(StdRng::from_os_rng()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// Starts listening, the event pump and the four scheduling loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A stopped session has disconnected its peers and told the
        // trackers it left; it cannot be restarted.
        let Some(events_rx) = self.events_rx.lock().take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(ClientError::AlreadyStopped);
        };

        let listener = match TcpListener::bind(("0.0.0.0", self.port.load(Ordering::SeqCst))).await
        {
            Ok(listener) => listener,
            Err(e) => {
                *self.events_rx.lock() = Some(events_rx);
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        // Keep the real port when the caller asked for an ephemeral one.
        self.port
            .store(listener.local_addr()?.port(), Ordering::SeqCst);

        tracing::info!(
            name = %self.store.name(),
            port = self.port(),
            "session started"
        );

        let mut tasks = self.tasks.lock();

        let client = self.clone();
        tasks.push(tokio::spawn(client.accept_loop(listener)));

        let client = self.clone();
        tasks.push(tokio::spawn(client.event_pump(events_rx)));

        let client = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(PEER_LOOP_INTERVAL);
            while client.is_running() {
                tick.tick().await;
                client.process_peers().await;
            }
        }));

        let client = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(UPLOAD_LOOP_INTERVAL);
            while client.is_running() {
                tick.tick().await;
                client.process_uploads().await;
            }
        }));

        let client = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(DOWNLOAD_LOOP_INTERVAL);
            while client.is_running() {
                tick.tick().await;
                client.process_downloads().await;
            }
        }));

        let client = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(TRACKER_LOOP_INTERVAL);
            while client.is_running() {
                tick.tick().await;
                client.process_trackers().await;
            }
        }));

        Ok(())
    }

    /// Stops the session: closes the listener, disconnects every peer and
    /// announces departure to each tracker once.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!(name = %self.store.name(), "stopping session");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        for peer in self.peers.iter() {
            peer.value().disconnect();
        }
        self.peers.clear();
        self.seeders.clear();
        self.leechers.clear();

        let request = self.announce_request(TrackerEvent::Stopped);
        let departures = self
            .trackers
            .iter()
            .map(|tracker| {
                let tracker = tracker.clone();
                async move {
                    if let Err(e) = tracker.depart(request).await {
                        tracing::debug!(url = %tracker.url(), error = %e, "departure announce failed");
                    }
                }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(departures).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    // --- counters ----------------------------------------------------------

    /// Fractional completion estimate in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        self.store.progress()
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    /// Bytes received inside the current throttle window.
    pub fn download_rate(&self) -> u64 {
        self.download_throttle.value()
    }

    /// Bytes sent inside the current throttle window.
    pub fn upload_rate(&self) -> u64 {
        self.upload_throttle.value()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers
            .iter()
            .map(|entry| PeerStats {
                addr: *entry.key(),
                download_rate: self.download_throttle.rate_for(*entry.key()),
                upload_rate: self.upload_throttle.rate_for(*entry.key()),
            })
            .collect()
    }

    // --- runtime limits ----------------------------------------------------

    pub fn set_max_upload_rate(&self, bytes_per_sec: u64) {
        self.upload_throttle.set_limit(bytes_per_sec);
    }

    pub fn set_max_download_rate(&self, bytes_per_sec: u64) {
        self.download_throttle.set_limit(bytes_per_sec);
    }

    pub fn set_max_seeders(&self, max: usize) {
        self.max_seeders.store(max, Ordering::Relaxed);
    }

    pub fn set_max_leechers(&self, max: usize) {
        self.max_leechers.store(max, Ordering::Relaxed);
    }

    // --- connection lifecycle ----------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if !self.is_running() {
                        return;
                    }
                    tracing::debug!(%addr, "inbound connection");
                    match Peer::accept(
                        stream,
                        self.store.clone(),
                        self.peer_id,
                        self.events_tx.clone(),
                    ) {
                        Ok(peer) => self.register_peer(peer),
                        Err(e) => tracing::debug!(%addr, error = %e, "accept failed"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "listener error");
                    return;
                }
            }
        }
    }

    /// Folds tracker-returned endpoints into the peer table, creating
    /// outbound sessions for unseen ones. Our own listen address is skipped.
    pub(super) fn merge_endpoints(self: &Arc<Self>, endpoints: Vec<SocketAddr>) {
        for endpoint in endpoints {
            if self.is_own_endpoint(endpoint) {
                continue;
            }

            if let Entry::Vacant(slot) = self.peers.entry(endpoint) {
                slot.insert(Peer::connect(
                    endpoint,
                    self.store.clone(),
                    self.peer_id,
                    self.events_tx.clone(),
                ));
            }
        }
    }

    fn register_peer(&self, peer: Arc<Peer>) {
        match self.peers.entry(peer.addr()) {
            Entry::Vacant(slot) => {
                slot.insert(peer);
            }
            Entry::Occupied(_) => peer.disconnect(),
        }
    }

    fn is_own_endpoint(&self, addr: SocketAddr) -> bool {
        addr.port() == self.port() && (addr.ip().is_loopback() || addr.ip().is_unspecified())
    }

    fn remove_peer(&self, addr: SocketAddr) {
        self.peers.remove(&addr);
        self.seeders.remove(&addr);
        self.leechers.remove(&addr);
    }

    // --- event pump --------------------------------------------------------

    async fn event_pump(self: Arc<Self>, mut events_rx: UnboundedReceiver<PeerEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                PeerEvent::StateChanged { .. } => {
                    self.process_peers().await;
                }
                PeerEvent::BlockRequested(request) => {
                    self.outgoing.push(request);
                    self.process_uploads().await;
                }
                PeerEvent::BlockCancelled(request) => {
                    self.outgoing.cancel(&request);
                    self.process_uploads().await;
                }
                PeerEvent::BlockReceived(data) => {
                    self.handle_block_received(data);
                    self.process_downloads().await;
                }
                PeerEvent::Disconnected { addr } => {
                    self.remove_peer(addr);
                }
            }
        }
    }

    /// Queues a delivered block and deduplicates in-flight copies: the
    /// requested flag is cleared on the source, and every other peer with
    /// the same block in flight gets a cancel.
    fn handle_block_received(&self, data: BlockData) {
        if let Some(peer) = self.peers.get(&data.addr) {
            peer.clear_requested(data.piece, data.block);
        }

        let length = self.store.block_size(data.piece, data.block);
        let begin = data.block * crate::constants::BLOCK_SIZE;

        for entry in self.peers.iter() {
            if *entry.key() == data.addr {
                continue;
            }
            if entry.value().clear_requested(data.piece, data.block) {
                entry.value().send_cancel(data.piece, begin, length);
            }
        }

        self.incoming.push(data);
    }

    // --- periodic loops ----------------------------------------------------

    /// Peer maintenance: liveness, interest, choking and subset admission.
    pub(super) async fn process_peers(self: &Arc<Self>) {
        let Ok(_guard) = self.guards.peers.try_lock() else {
            return;
        };

        let verified = self.store.verified_flags();
        let complete = self.store.is_complete();

        let mut ranked: Vec<Arc<Peer>> =
            self.peers.iter().map(|entry| entry.value().clone()).collect();
        ranked.sort_by_key(|peer| std::cmp::Reverse(peer.pieces_required(&verified)));

        for peer in ranked {
            // A session that died before its table insert finished emits no
            // further events; reap it here.
            if peer.is_disconnected() {
                self.remove_peer(peer.addr());
                continue;
            }

            if peer.last_active().elapsed() > PEER_TIMEOUT {
                peer.disconnect();
                continue;
            }

            if !peer.is_handshake_complete() {
                continue;
            }

            if complete {
                peer.send_not_interested();
            } else {
                peer.send_interested();
            }

            // Nothing left to exchange in either direction.
            if complete && peer.is_complete() {
                peer.disconnect();
                continue;
            }

            peer.send_keep_alive();

            if self.store.is_started()
                && self.leechers.len() <= self.max_leechers.load(Ordering::Relaxed)
                && peer.is_peer_interested()
                && peer.am_choking()
            {
                peer.send_unchoke();
                self.leechers.insert(peer.addr());
            }

            if !complete
                && self.seeders.len() <= self.max_seeders.load(Ordering::Relaxed)
                && !peer.is_peer_choking()
            {
                self.seeders.insert(peer.addr());
            }
        }
    }

    /// Serves queued block requests while the upload budget lasts.
    pub(super) async fn process_uploads(self: &Arc<Self>) {
        let Ok(_guard) = self.guards.uploads.try_lock() else {
            return;
        };

        while !self.upload_throttle.is_throttled() {
            let Some(entry) = self.outgoing.pop() else {
                break;
            };
            if entry.cancelled {
                continue;
            }

            let request = entry.request;
            if !self.store.is_verified(request.piece) {
                continue;
            }

            let Some(peer) = self.peers.get(&request.addr).map(|p| p.value().clone()) else {
                continue;
            };

            let data = match self
                .store
                .read_block(request.piece, request.begin, request.length)
                .await
            {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(piece = request.piece, error = %e, "upload read failed");
                    continue;
                }
            };

            let length = data.len() as u64;
            peer.send_piece(request.piece, request.begin, data);
            self.upload_throttle.add(length, Some(request.addr));
            self.store.add_uploaded(length);
        }
    }

    /// Drains delivered blocks into the store, then plans new requests.
    pub(super) async fn process_downloads(self: &Arc<Self>) {
        let Ok(_guard) = self.guards.downloads.try_lock() else {
            return;
        };

        let mut newly_verified = Vec::new();

        while let Some(block) = self.incoming.pop() {
            match self.store.write_block(block.piece, block.block, &block.data).await {
                Ok(VerifyOutcome::Verified {
                    newly_verified: true,
                    ..
                }) => newly_verified.push(block.piece),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(piece = block.piece, error = %e, "block write failed");
                }
            }
        }

        if !newly_verified.is_empty() {
            for entry in self.peers.iter() {
                let peer = entry.value();
                if !peer.is_handshake_complete() {
                    continue;
                }
                for &piece in &newly_verified {
                    peer.send_have(piece);
                }
            }
            self.process_peers().await;
        }

        if self.store.is_complete() {
            return;
        }

        let snapshot = self.store.snapshot();
        let mut views: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .filter(|entry| entry.value().is_handshake_complete())
            .map(|entry| entry.value().snapshot())
            .collect();

        let plan = {
            let mut rng = self.rng.lock();
            scheduler::plan_requests(
                &snapshot,
                &mut views,
                &self.store,
                &self.download_throttle,
                &mut *rng,
            )
        };

        for request in plan {
            if let Some(peer) = self.peers.get(&request.addr) {
                peer.send_request(request.piece, request.begin, request.length);
            }
        }
    }

    /// Re-announces to every tracker whose own interval has elapsed.
    pub(super) async fn process_trackers(self: &Arc<Self>) {
        for tracker in &self.trackers {
            if !tracker.due() {
                continue;
            }

            let request = self.announce_request(TrackerEvent::None);
            match tracker.announce(request).await {
                Ok(endpoints) => {
                    self.merge_endpoints(endpoints);
                    tracing::debug!(
                        url = %tracker.url(),
                        peers = self.peers.len(),
                        "peer table updated"
                    );
                }
                Err(e) => {
                    tracing::debug!(url = %tracker.url(), error = %e, "announce failed");
                }
            }
        }
    }

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: *self.store.info_hash().as_bytes(),
            peer_id: self.peer_id.0,
            port: self.port(),
            uploaded: self.store.uploaded(),
            downloaded: self.store.downloaded(),
            left: self.store.left(),
            event,
        }
    }
}
