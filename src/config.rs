/// Stack buffer size for body transfer chunks. `Config::chunk_len` is
/// clamped to this.
pub const CHUNK_BUF_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Preferred body transfer chunk size in bytes.
    pub chunk_len: usize,
    /// Idle heartbeat period in milliseconds.
    pub heartbeat_period_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_len: CHUNK_BUF_LEN,
            heartbeat_period_ms: 2000,
        }
    }
}
