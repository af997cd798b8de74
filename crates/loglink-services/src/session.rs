//! Per-peer transfer bookkeeping shared by both ends of the notify link.

/// Where a transfer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// A start request is being resolved against storage.
    Requested,
    Active,
    /// Final bytes sent or received, resources being released.
    Terminating,
}

/// State of at most one transfer.
///
/// While active, `bytes_transferred <= expected_size` and
/// `next_chunk_index` equals the number of chunks accepted so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSession {
    state: SessionState,
    resource_name: String,
    expected_size: u32,
    bytes_transferred: u32,
    next_chunk_index: u16,
    chunk_size: u16,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    pub fn bytes_transferred(&self) -> u32 {
        self.bytes_transferred
    }

    pub fn next_chunk_index(&self) -> u16 {
        self.next_chunk_index
    }

    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    /// Bytes still owed before the announced size is reached.
    pub fn remaining(&self) -> u32 {
        self.expected_size.saturating_sub(self.bytes_transferred)
    }

    pub fn set_requested(&mut self, name: &str) {
        self.state = SessionState::Requested;
        self.resource_name = name.to_string();
    }

    /// Enter `Active` with fresh counters.
    pub fn begin(&mut self, name: &str, expected_size: u32, chunk_size: u16) {
        *self = Self {
            state: SessionState::Active,
            resource_name: name.to_string(),
            expected_size,
            bytes_transferred: 0,
            next_chunk_index: 0,
            chunk_size,
        };
    }

    /// Count one chunk of `len` bytes carrying `index`. Callers clamp `len`
    /// to `remaining()` first.
    pub fn record_chunk(&mut self, index: u16, len: u32) {
        debug_assert!(len <= self.remaining());
        self.bytes_transferred += len.min(self.remaining());
        self.next_chunk_index = index.wrapping_add(1);
    }

    pub fn set_terminating(&mut self) {
        self.state = SessionState::Terminating;
    }

    /// Back to `Idle` with counters zeroed.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
