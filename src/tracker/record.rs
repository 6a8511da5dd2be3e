use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::error::TrackerError;
use super::http::HttpTracker;
use super::response::{AnnounceRequest, TrackerEvent};
use super::udp::UdpTracker;
use crate::constants::DEFAULT_ANNOUNCE_INTERVAL;

struct Cadence {
    last_announce: Option<Instant>,
    interval: Duration,
    announced: bool,
    last_peers: Vec<SocketAddr>,
}

/// One announce endpoint and its polling cadence.
///
/// Each tracker runs on its own interval: the default until the tracker
/// advertises one, then whatever the last response asked for. The first
/// successful announce of a session carries `started`, later ones no event;
/// `stopped` is sent once on shutdown via [`Tracker::depart`].
pub struct Tracker {
    url: String,
    state: Mutex<Cadence>,
}

impl Tracker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(Cadence {
                last_announce: None,
                interval: DEFAULT_ANNOUNCE_INTERVAL,
                announced: false,
                last_peers: Vec::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether this tracker's own interval has elapsed since its last
    /// request.
    pub fn due(&self) -> bool {
        let state = self.state.lock();
        match state.last_announce {
            None => true,
            Some(at) => at.elapsed() >= state.interval,
        }
    }

    /// The peer list from the most recent successful announce.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.state.lock().last_peers.clone()
    }

    /// Announces and returns the endpoints the tracker handed back.
    ///
    /// The attempt time is recorded up front, so a failing tracker is not
    /// hammered but simply retried after its interval.
    pub async fn announce(
        &self,
        mut request: AnnounceRequest,
    ) -> Result<Vec<SocketAddr>, TrackerError> {
        {
            let mut state = self.state.lock();
            state.last_announce = Some(Instant::now());
            request.event = if state.announced {
                TrackerEvent::None
            } else {
                TrackerEvent::Started
            };
        }

        let response = self.dispatch(&request).await?;

        let mut state = self.state.lock();
        state.announced = true;
        if response.interval > 0 {
            state.interval = Duration::from_secs(response.interval as u64);
        }
        state.last_peers = response.peers.clone();

        tracing::debug!(
            url = %self.url,
            peers = response.peers.len(),
            interval = response.interval,
            "announce ok"
        );

        Ok(response.peers)
    }

    /// The final announce of a session.
    pub async fn depart(&self, mut request: AnnounceRequest) -> Result<(), TrackerError> {
        request.event = TrackerEvent::Stopped;
        self.dispatch(&request).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        request: &AnnounceRequest,
    ) -> Result<super::response::AnnounceResponse, TrackerError> {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            HttpTracker::new(&self.url)?.announce(request).await
        } else if self.url.starts_with("udp://") {
            UdpTracker::connect(&self.url).await?.announce(request).await
        } else {
            Err(TrackerError::UnsupportedScheme(self.url.clone()))
        }
    }
}
