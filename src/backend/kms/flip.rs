//! Per-output swap bookkeeping for the page-flip handshake.

/// Tracks which buffer is painted next and whether a flip is in flight.
///
/// The back buffer advances only when the hardware confirms a flip, so a
/// request that was never issued (or never confirmed) keeps painting into the
/// same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapState {
    buffer_count: usize,
    back_buffer: usize,
    in_flight: bool,
}

impl SwapState {
    pub fn new(buffer_count: usize) -> Self {
        assert!(buffer_count >= 1);
        Self {
            buffer_count,
            back_buffer: 0,
            in_flight: false,
        }
    }

    /// The buffer index to paint next.
    pub fn back_buffer(&self) -> usize {
        self.back_buffer
    }

    /// A swap was requested and its completion has not arrived yet.
    pub fn awaiting_confirm(&self) -> bool {
        self.in_flight
    }

    pub fn request_issued(&mut self) {
        debug_assert!(!self.in_flight, "swap requested while one is in flight");
        self.in_flight = true;
    }

    /// Records a confirmed flip and returns the new back buffer.
    ///
    /// Completion events with no matching request are ignored.
    pub fn confirm(&mut self) -> usize {
        if self.in_flight {
            self.in_flight = false;
            self.back_buffer = (self.back_buffer + 1) % self.buffer_count;
        }
        self.back_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_buffer_alternates_on_confirmations() {
        let mut swap = SwapState::new(2);
        assert_eq!(swap.back_buffer(), 0);

        for expected in [1, 0, 1, 0] {
            swap.request_issued();
            assert_eq!(swap.confirm(), expected);
            assert_eq!(swap.back_buffer(), expected);
        }
    }

    #[test]
    fn first_tick_needs_no_wait() {
        let mut swap = SwapState::new(2);
        // First paint goes straight to buffer 0 with nothing to wait for.
        assert!(!swap.awaiting_confirm());
        swap.request_issued();

        // The second tick must wait before painting buffer 1.
        assert!(swap.awaiting_confirm());
        assert_eq!(swap.back_buffer(), 0);
        swap.confirm();
        assert!(!swap.awaiting_confirm());
        assert_eq!(swap.back_buffer(), 1);
    }

    #[test]
    fn n_requests_n_confirms_in_order() {
        let mut swap = SwapState::new(2);
        let mut confirmed = Vec::new();
        for _ in 0..6 {
            swap.request_issued();
            confirmed.push(swap.confirm());
        }
        assert_eq!(confirmed, [1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn back_buffer_only_moves_on_confirm() {
        let mut swap = SwapState::new(2);
        swap.request_issued();
        assert_eq!(swap.back_buffer(), 0);

        // A rogue completion with no request pending changes nothing.
        swap.confirm();
        assert_eq!(swap.back_buffer(), 1);
        swap.confirm();
        assert_eq!(swap.back_buffer(), 1);
    }

    #[test]
    fn single_buffer_never_advances() {
        let mut swap = SwapState::new(1);
        swap.request_issued();
        assert_eq!(swap.confirm(), 0);
        assert_eq!(swap.back_buffer(), 0);
    }
}
