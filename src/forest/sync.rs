/// Counts acknowledgements toward a stop value. A coarsening parent arms
/// one of these to expect a message from each of its `2^N` children before
/// it clears its child list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCounter {
    count: u32,
    stop: u32,
}

impl SyncCounter {
    pub fn new(stop: u32) -> Self {
        Self { count: 0, stop }
    }

    /// Records one arrival, returning true on the arrival that reaches the
    /// stop value.
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        self.count == self.stop
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn is_done(&self) -> bool {
        self.count >= self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_to_stop() {
        let mut sync = SyncCounter::new(4);

        assert!(!sync.tick());
        assert!(!sync.tick());
        assert!(!sync.tick());
        assert!(sync.tick());
        assert!(sync.is_done());

        sync.reset();
        assert!(!sync.is_done());
    }
}
