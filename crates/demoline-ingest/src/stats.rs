//! Running statistics over one demo stream.

/// A zero run this long marks a stream as anomalous.
pub const ANOMALOUS_ZERO_RUN: u64 = 384;

/// Length, chunk count and longest run of `0x00` bytes seen so far.
///
/// Zero runs are tracked across chunk boundaries, so the result does not
/// depend on how the peer split its writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    len: u64,
    chunks: u64,
    current_zero_run: u64,
    longest_zero_run: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk into the statistics.
    pub fn record(&mut self, chunk: &[u8]) {
        self.len += chunk.len() as u64;
        self.chunks += 1;

        for &byte in chunk {
            if byte == 0 {
                self.current_zero_run += 1;
                self.longest_zero_run = self.longest_zero_run.max(self.current_zero_run);
            } else {
                self.current_zero_run = 0;
            }
        }
    }

    /// Total bytes recorded.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn longest_zero_run(&self) -> u64 {
        self.longest_zero_run
    }

    pub fn anomalous(&self) -> bool {
        self.longest_zero_run >= ANOMALOUS_ZERO_RUN
    }
}
