//! Character-driven reception of asynchronous gdb server packets.
//!
//! Console output (`O`) packets and stop replies arrive whenever the target
//! feels like it, not in response to a request. The front end polls the
//! socket between commands and pushes each incoming byte through this state
//! machine; a complete, checksum-verified payload pops out once the closing
//! checksum digits arrive.

use super::{hex_val, MAX_PACKET_LEN};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    /// Hunting for the `$` start character; everything else is dropped.
    WaitingStart,
    /// Accumulating payload bytes until `#`.
    ReadingData,
    /// Expecting the high checksum digit.
    ChecksumHigh,
    /// Expecting the low checksum digit.
    ChecksumLow,
}

pub struct AsyncPacketReceiver {
    state: State,
    /// Running sum over the payload received so far.
    cksum: u8,
    /// Checksum claimed by the sender.
    rx_cksum: u8,
    buf: Vec<u8>,
}

impl AsyncPacketReceiver {
    pub fn new() -> Self {
        AsyncPacketReceiver {
            state: State::WaitingStart,
            cksum: 0,
            rx_cksum: 0,
            buf: Vec::with_capacity(MAX_PACKET_LEN),
        }
    }

    /// Feed one incoming byte. Returns the validated payload once a whole
    /// packet has arrived; a checksum mismatch or a payload overflowing the
    /// buffer silently restarts the hunt for the next packet.
    pub fn feed(&mut self, c: u8) -> Option<&[u8]> {
        match self.state {
            State::WaitingStart => {
                if c == b'$' {
                    self.buf.clear();
                    self.cksum = 0;
                    self.state = State::ReadingData;
                }
            }
            State::ReadingData => {
                if c == b'#' {
                    self.state = State::ChecksumHigh;
                } else if self.buf.len() == MAX_PACKET_LEN - 1 {
                    self.state = State::WaitingStart;
                } else {
                    self.buf.push(c);
                    self.cksum = self.cksum.wrapping_add(c);
                }
            }
            State::ChecksumHigh => {
                self.rx_cksum = hex_val(c) << 4;
                self.state = State::ChecksumLow;
            }
            State::ChecksumLow => {
                self.rx_cksum |= hex_val(c);
                self.state = State::WaitingStart;
                if self.cksum == self.rx_cksum {
                    return Some(&self.buf);
                }
            }
        }
        None
    }
}

impl Default for AsyncPacketReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(rx: &mut AsyncPacketReceiver, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut result = None;
        for &c in bytes {
            if let Some(p) = rx.feed(c) {
                result = Some(p.to_vec());
            }
        }
        result
    }

    #[test]
    fn assembles_a_packet_byte_by_byte() {
        let mut rx = AsyncPacketReceiver::new();
        assert_eq!(feed_all(&mut rx, b"$T05thread:01;#07").as_deref(), Some(&b"T05thread:01;"[..]));
    }

    #[test]
    fn delivery_is_independent_of_arrival_granularity() {
        // the same bytes split at every possible point produce the same
        // packet and leave the machine in the same state
        let wire = b"$OK#9a";
        for split in 0..wire.len() {
            let mut rx = AsyncPacketReceiver::new();
            let first = feed_all(&mut rx, &wire[..split]);
            let second = feed_all(&mut rx, &wire[split..]);
            assert_eq!(first.or(second).as_deref(), Some(&b"OK"[..]));
            assert_eq!(rx.state, State::WaitingStart);
        }
    }

    #[test]
    fn garbage_between_packets_is_dropped() {
        let mut rx = AsyncPacketReceiver::new();
        assert_eq!(feed_all(&mut rx, b"+++noise$OK#9a").as_deref(), Some(&b"OK"[..]));
    }

    #[test]
    fn bad_checksum_yields_nothing_and_recovers() {
        let mut rx = AsyncPacketReceiver::new();
        assert_eq!(feed_all(&mut rx, b"$OK#00"), None);
        assert_eq!(feed_all(&mut rx, b"$OK#9a").as_deref(), Some(&b"OK"[..]));
    }

    #[test]
    fn oversized_payload_restarts_the_hunt() {
        let mut rx = AsyncPacketReceiver::new();
        let mut wire = vec![b'$'];
        wire.extend(std::iter::repeat(b'x').take(MAX_PACKET_LEN));
        assert_eq!(feed_all(&mut rx, &wire), None);
        assert_eq!(rx.state, State::WaitingStart);
        assert_eq!(feed_all(&mut rx, b"$OK#9a").as_deref(), Some(&b"OK"[..]));
    }
}
