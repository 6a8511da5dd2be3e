//! Piece and request scheduling.
//!
//! Pure functions over snapshots of the store and peer state, so the
//! selection logic is deterministic under a seeded RNG. The controller
//! executes the returned plan against the live peers.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::constants::BLOCK_SIZE;
use crate::peer::{BlockRequest, PeerSnapshot};
use crate::storage::{PieceStore, StoreSnapshot};
use crate::throttle::Throttle;

/// Rarest-first piece ranking with anti-starvation and jitter.
///
/// `score = -2 × block_progress + rarity + jitter`: partial progress is
/// penalized (so effort does not smear across many half-finished pieces
/// while still favoring fresh rare pieces over endlessly-trickling ones),
/// rarity is the fraction of known peers lacking the piece, and a small
/// random term breaks ties between runs. Highest score first.
pub fn rank_pieces<R: Rng>(
    snapshot: &StoreSnapshot,
    peers: &[PeerSnapshot],
    rng: &mut R,
) -> Vec<u32> {
    let mut scored: Vec<(f64, u32)> = (0..snapshot.verified.len() as u32)
        .map(|piece| {
            let progress = block_progress(snapshot, piece);
            let rarity = rarity(peers, piece);
            let jitter: f64 = rng.random_range(0.0..0.1);
            (-2.0 * progress + rarity + jitter, piece)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, piece)| piece).collect()
}

fn block_progress(snapshot: &StoreSnapshot, piece: u32) -> f64 {
    let blocks = &snapshot.acquired[piece as usize];
    if blocks.is_empty() {
        return 0.0;
    }
    blocks.iter().filter(|&&b| b).count() as f64 / blocks.len() as f64
}

fn rarity(peers: &[PeerSnapshot], piece: u32) -> f64 {
    if peers.is_empty() {
        return 0.0;
    }
    let lacking = peers
        .iter()
        .filter(|p| !p.has[piece as usize])
        .count() as f64;
    lacking / peers.len() as f64
}

/// Plans the block requests for one download pass.
///
/// Peers are shuffled per call; for each ranked unverified piece every
/// unacquired block is matched to a peer that has the piece, subject to: not
/// already requested from that peer, at most 1 outstanding request per peer,
/// at most 2 outstanding requests for the block across all peers, and
/// download throttle budget left. Each planned request charges the throttle
/// and is reflected in the views so later decisions in the same pass see it.
pub fn plan_requests<R: Rng>(
    snapshot: &StoreSnapshot,
    peers: &mut [PeerSnapshot],
    store: &PieceStore,
    throttle: &Throttle,
    rng: &mut R,
) -> Vec<BlockRequest> {
    let ranked = rank_pieces(snapshot, peers, rng);

    let mut order: Vec<usize> = (0..peers.len()).collect();
    order.shuffle(rng);

    let mut plan = Vec::new();

    for piece in ranked {
        if snapshot.verified[piece as usize] {
            continue;
        }

        for &pi in &order {
            if !peers[pi].has[piece as usize] {
                continue;
            }

            for block in 0..snapshot.acquired[piece as usize].len() as u32 {
                if throttle.is_throttled() {
                    continue;
                }
                if snapshot.acquired[piece as usize][block as usize] {
                    continue;
                }
                if peers[pi].requested[piece as usize][block as usize] {
                    continue;
                }
                if outstanding(&peers[pi]) > 1 {
                    continue;
                }
                let in_flight = peers
                    .iter()
                    .filter(|p| p.requested[piece as usize][block as usize])
                    .count();
                if in_flight > 2 {
                    continue;
                }

                let length = store.block_size(piece, block);
                let addr = peers[pi].addr;

                throttle.add(length as u64, Some(addr));
                peers[pi].requested[piece as usize][block as usize] = true;
                plan.push(BlockRequest {
                    addr,
                    piece,
                    begin: block * BLOCK_SIZE,
                    length,
                });
            }
        }
    }

    plan
}

fn outstanding(peer: &PeerSnapshot) -> usize {
    peer.requested
        .iter()
        .map(|blocks| blocks.iter().filter(|&&b| b).count())
        .sum()
}
