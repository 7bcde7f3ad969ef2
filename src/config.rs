//! Runtime-configurable tuning parameters for arbor.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `ARBOR_`) or by constructing a custom `ArborConfig`.

use std::time::Duration;

/// Tuning parameters for connection setup and collective operations.
#[derive(Debug, Clone)]
pub struct ArborConfig {
    /// Timeout for individual send/recv operations within collectives.
    pub collective_timeout: Duration,

    /// Timeout for establishing a single tree edge or the root
    /// subscription during `connect`.
    pub connect_timeout: Duration,

    /// Timeout for the coordinator to see all expected nodes join.
    pub formation_timeout: Duration,

    /// Chunk size, in elements, used when a collective call is made with
    /// `flat = false`. Buffers are split into chunks of this many
    /// elements (last chunk may be shorter) and pipelined up the tree.
    pub chunk_elems: usize,

    /// Upper bound on a single wire frame. Larger frames are rejected.
    pub max_frame_bytes: usize,

    /// Host address the edge and publish listeners bind to. Listeners
    /// always bind port 0 and advertise the assigned port.
    pub bind_host: String,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            collective_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            formation_timeout: Duration::from_secs(60),
            chunk_elems: 64 * 1024,
            max_frame_bytes: 64 * 1024 * 1024, // 64 MiB
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

impl ArborConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `ARBOR_COLLECTIVE_TIMEOUT_SECS`
    /// - `ARBOR_CONNECT_TIMEOUT_SECS`
    /// - `ARBOR_FORMATION_TIMEOUT_SECS`
    /// - `ARBOR_CHUNK_ELEMS`
    /// - `ARBOR_MAX_FRAME_BYTES`
    /// - `ARBOR_BIND_HOST`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("ARBOR_COLLECTIVE_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.collective_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.connect_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_FORMATION_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.formation_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_CHUNK_ELEMS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.chunk_elems = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("ARBOR_MAX_FRAME_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_frame_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("ARBOR_BIND_HOST") {
            if !v.is_empty() {
                cfg.bind_host = v;
            }
        }

        cfg
    }
}
