//! The control protocol between driver and stub (spec §4.1).
//!
//! Two unidirectional byte streams. Driver → stub carries a single command
//! byte (`STEP`). Stub → driver carries a one-time 4-byte pid handshake
//! followed by a stream of `READY` / `DIED` / eof events. Every event is
//! self-framed: the tag byte alone determines how many more bytes to expect,
//! so a reader that gets a short read can always resume once more bytes
//! arrive without losing synchronization.

/// Driver → stub: request one synchronization cycle.
pub(crate) const CMD_STEP: u8 = b's';

/// Stub → driver: the slave is blocked on tty input with nothing unread.
pub(crate) const EVT_READY: u8 = b'r';

/// Stub → driver: the slave exited or was signalled. Followed by two bytes:
/// terminating signal (0 if exited normally) and exit status (0 if
/// signalled).
pub(crate) const EVT_DIED: u8 = b'd';

/// One event decoded off the info pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubEvent {
    Ready,
    Died { signal: u8, code: u8 },
}

pub(crate) fn encode_pid(pid: u32) -> [u8; 4] {
    pid.to_be_bytes()
}

pub(crate) fn decode_pid(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Incrementally decodes `StubEvent`s out of a byte stream that may arrive in
/// arbitrarily small chunks (spec §4.1's "tolerant of partial reads").
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    pending: Vec<u8>,
}

impl EventDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes in and drain as many complete events as are
    /// available. Leftover partial bytes stay buffered for the next call.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<StubEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            match self.pending.first() {
                None => break,
                Some(&EVT_READY) => {
                    events.push(StubEvent::Ready);
                    self.pending.drain(..1);
                }
                Some(&EVT_DIED) => {
                    if self.pending.len() < 3 {
                        break;
                    }
                    events.push(StubEvent::Died {
                        signal: self.pending[1],
                        code: self.pending[2],
                    });
                    self.pending.drain(..3);
                }
                Some(other) => {
                    // Protocol desync — drop the unrecognized byte rather than
                    // wedging the decoder forever.
                    tracing::warn!(byte = other, "unrecognized info-pipe tag byte, discarding");
                    self.pending.drain(..1);
                }
            }
        }
        events
    }
}

pub(crate) fn encode_died(signal: u8, code: u8) -> [u8; 3] {
    [EVT_DIED, signal, code]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_round_trips() {
        assert_eq!(decode_pid(encode_pid(4_242_424)), 4_242_424);
    }

    #[test]
    fn ready_decodes_whole() {
        let mut dec = EventDecoder::new();
        assert_eq!(dec.feed(&[EVT_READY]), vec![StubEvent::Ready]);
    }

    #[test]
    fn died_decodes_whole() {
        let mut dec = EventDecoder::new();
        assert_eq!(
            dec.feed(&encode_died(15, 0)),
            vec![StubEvent::Died { signal: 15, code: 0 }]
        );
    }

    #[test]
    fn died_decodes_across_partial_reads() {
        let mut dec = EventDecoder::new();
        assert_eq!(dec.feed(&[EVT_DIED]), vec![]);
        assert_eq!(dec.feed(&[9]), vec![]);
        assert_eq!(
            dec.feed(&[0]),
            vec![StubEvent::Died { signal: 9, code: 0 }]
        );
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut dec = EventDecoder::new();
        let mut buf = vec![EVT_READY];
        buf.extend_from_slice(&encode_died(0, 7));
        assert_eq!(
            dec.feed(&buf),
            vec![StubEvent::Ready, StubEvent::Died { signal: 0, code: 7 }]
        );
    }

    #[test]
    fn unrecognized_tag_is_skipped_not_fatal() {
        let mut dec = EventDecoder::new();
        let mut buf = vec![b'?'];
        buf.push(EVT_READY);
        assert_eq!(dec.feed(&buf), vec![StubEvent::Ready]);
    }

    proptest::proptest! {
        #[test]
        fn decoder_never_panics_on_arbitrary_bytes(bytes: Vec<u8>) {
            let mut dec = EventDecoder::new();
            for chunk in bytes.chunks(3) {
                let _ = dec.feed(chunk);
            }
        }

        #[test]
        fn died_round_trips_through_decoder(sig: u8, code: u8) {
            let mut dec = EventDecoder::new();
            let events = dec.feed(&encode_died(sig, code));
            proptest::prop_assert_eq!(events, vec![StubEvent::Died { signal: sig, code }]);
        }
    }
}
