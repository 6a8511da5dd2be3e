//! Protocol constants and tuning parameters.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8] = b"-SW0001-";

// ============================================================================
// Data geometry
// ============================================================================

/// Block size: the unit of network request/transfer
pub const BLOCK_SIZE: u32 = 16 * 1024;

// ============================================================================
// Timeouts and cadences
// ============================================================================

/// A peer with no received traffic for this long is considered dead
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum gap between keep-alive messages to one peer
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Peer maintenance loop period
pub const PEER_LOOP_INTERVAL: Duration = Duration::from_millis(500);

/// Upload processing loop period
pub const UPLOAD_LOOP_INTERVAL: Duration = Duration::from_secs(1);

/// Download processing loop period
pub const DOWNLOAD_LOOP_INTERVAL: Duration = Duration::from_millis(500);

/// Tracker polling loop period
pub const TRACKER_LOOP_INTERVAL: Duration = Duration::from_secs(5);

/// Announce interval used until a tracker advertises its own
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Limits
// ============================================================================

/// Rate limiter window
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

/// Default upload budget per throttle window
pub const DEFAULT_MAX_UPLOAD_BYTES_PER_SEC: u64 = 100 * BLOCK_SIZE as u64;

/// Default download budget per throttle window
pub const DEFAULT_MAX_DOWNLOAD_BYTES_PER_SEC: u64 = 100 * BLOCK_SIZE as u64;

/// Default cap on the seeder subset
pub const DEFAULT_MAX_SEEDERS: usize = 200;

/// Default cap on the leecher subset
pub const DEFAULT_MAX_LEECHERS: usize = 200;
