//! Decode-and-forward loop.
//!
//! Each iteration takes one envelope, decodes it, and sends the body with a
//! single `sendto`. Per-message failures are counted and the loop moves on;
//! only a fatal send stops it.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::envelope::{Envelope, EnvelopeDecoder};
use crate::net::{DatagramSink, SendError, SendOutcome};
use crate::queue::{EnvelopeSource, Recv};
use crate::trace::{debug, warn};

use super::stats::WorkerStats;

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// The cancellation token fired.
    Cancelled,
    /// The queue producer went away and the queue is drained.
    Disconnected,
    /// A send failed in a way the socket cannot recover from.
    Fatal(SendError),
}

/// What happened to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The payload was sent; the socket accepted this many bytes.
    Sent(usize),
    /// The envelope did not decode.
    DecodeFailed,
    /// The envelope decoded to no payload; nothing was sent.
    NoPayload,
    /// The socket buffer was full.
    WouldBlock,
    /// Nobody is listening at the destination.
    Refused,
    /// The loop must stop.
    Fatal(SendError),
}

/// The dispatch loop state: decoder scratch, destination, and counters.
pub struct Dispatcher<D, K> {
    decoder: D,
    sink: K,
    stats: Arc<WorkerStats>,
}

impl<D: EnvelopeDecoder, K: DatagramSink> Dispatcher<D, K> {
    pub fn new(decoder: D, sink: K, stats: Arc<WorkerStats>) -> Self {
        Self {
            decoder,
            sink,
            stats,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Decodes `envelope` and forwards its payload.
    pub fn dispatch(&mut self, envelope: &Envelope) -> Dispatched {
        let payload = match self.decoder.decode(envelope.as_bytes()) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.stats.record_empty_body();
                return Dispatched::NoPayload;
            }
            Err(_e) => {
                debug!(error = %_e, len = envelope.len(), "dropping undecodable envelope");
                self.stats.record_decode_error();
                return Dispatched::DecodeFailed;
            }
        };

        match SendOutcome::from_result(self.sink.send_datagram(payload)) {
            SendOutcome::Sent(n) => {
                if n < payload.len() {
                    warn!(sent = n, len = payload.len(), "short datagram send");
                }
                self.stats.record_sent();
                Dispatched::Sent(n)
            }
            SendOutcome::WouldBlock => {
                self.stats.record_would_block();
                Dispatched::WouldBlock
            }
            SendOutcome::Refused => {
                self.stats.record_refused();
                Dispatched::Refused
            }
            SendOutcome::Fatal(err) => {
                debug!(error = %err, len = payload.len(), "fatal send");
                Dispatched::Fatal(err)
            }
        }
    }

    /// Runs until cancelled, disconnected, or a fatal send.
    pub fn run(&mut self, source: &mut impl EnvelopeSource, cancel: &CancelToken) -> DispatchExit {
        loop {
            let envelope = match source.recv(cancel) {
                Recv::Item(envelope) => envelope,
                Recv::Cancelled => return DispatchExit::Cancelled,
                Recv::Disconnected => return DispatchExit::Disconnected,
            };
            if let Dispatched::Fatal(err) = self.dispatch(&envelope) {
                return DispatchExit::Fatal(err);
            }
        }
    }

    pub fn into_parts(self) -> (D, K) {
        (self.decoder, self.sink)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rustix::io::Errno;

    use super::*;
    use crate::envelope::{AmqpDecoder, Body, MessageBuilder};
    use crate::runtime::StatsSnapshot;

    /// Sink that records payloads and replays scripted results.
    #[derive(Default)]
    struct ScriptedSink {
        sent: Vec<Vec<u8>>,
        script: VecDeque<Result<usize, Errno>>,
    }

    impl ScriptedSink {
        fn failing_with(results: impl IntoIterator<Item = Result<usize, Errno>>) -> Self {
            Self {
                sent: Vec::new(),
                script: results.into_iter().collect(),
            }
        }
    }

    impl DatagramSink for ScriptedSink {
        fn send_datagram(&mut self, payload: &[u8]) -> Result<usize, Errno> {
            self.sent.push(payload.to_vec());
            self.script.pop_front().unwrap_or(Ok(payload.len()))
        }
    }

    /// Source over a fixed list; reports `Disconnected` once drained.
    struct ListSource(VecDeque<Envelope>);

    impl EnvelopeSource for ListSource {
        fn recv(&mut self, cancel: &CancelToken) -> Recv<Envelope> {
            if cancel.is_cancelled() {
                return Recv::Cancelled;
            }
            self.0.pop_front().map_or(Recv::Disconnected, Recv::Item)
        }
    }

    fn data(body: &[u8]) -> Envelope {
        MessageBuilder::new()
            .body(Body::data(body.to_vec()))
            .encode()
            .into()
    }

    fn dispatcher(sink: ScriptedSink) -> Dispatcher<AmqpDecoder, ScriptedSink> {
        Dispatcher::new(AmqpDecoder::new(), sink, Arc::new(WorkerStats::new()))
    }

    #[test]
    fn valid_envelope_is_sent_once() {
        let mut d = dispatcher(ScriptedSink::default());
        assert_eq!(d.dispatch(&data(b"A")), Dispatched::Sent(1));
        assert_eq!(
            d.stats().snapshot(),
            StatsSnapshot {
                sent: 1,
                ..StatsSnapshot::default()
            }
        );
        assert_eq!(d.sink().sent, vec![b"A".to_vec()]);
    }

    #[test]
    fn malformed_envelope_is_counted_not_sent() {
        let mut d = dispatcher(ScriptedSink::default());
        assert_eq!(
            d.dispatch(&Envelope::from(&b"\x01\x02"[..])),
            Dispatched::DecodeFailed
        );
        assert_eq!(d.stats().snapshot().decode_errors, 1);
        assert_eq!(d.stats().snapshot().sent, 0);
        assert!(d.sink().sent.is_empty());
    }

    #[test]
    fn empty_body_is_skipped_silently() {
        let mut d = dispatcher(ScriptedSink::default());
        assert_eq!(d.dispatch(&data(b"")), Dispatched::NoPayload);
        let no_body: Envelope = MessageBuilder::new().message_id("x").encode().into();
        assert_eq!(d.dispatch(&no_body), Dispatched::NoPayload);

        let snap = d.stats().snapshot();
        assert_eq!(snap.sent, 0);
        assert_eq!(snap.decode_errors, 0);
        assert_eq!(snap.empty_bodies, 2);
        assert!(d.sink().sent.is_empty());
    }

    #[test]
    fn would_block_only_touches_its_counter() {
        let mut d = dispatcher(ScriptedSink::failing_with([
            Err(Errno::AGAIN),
            Err(Errno::AGAIN),
        ]));
        assert_eq!(d.dispatch(&data(b"A")), Dispatched::WouldBlock);
        assert_eq!(d.dispatch(&data(b"B")), Dispatched::WouldBlock);
        assert_eq!(
            d.stats().snapshot(),
            StatsSnapshot {
                would_block: 2,
                ..StatsSnapshot::default()
            }
        );
    }

    #[test]
    fn would_block_does_not_stop_the_loop() {
        let mut d = dispatcher(ScriptedSink::failing_with([Err(Errno::AGAIN)]));
        let mut source = ListSource(VecDeque::from([data(b"A"), data(b"B")]));
        assert_eq!(
            d.run(&mut source, &CancelToken::new()),
            DispatchExit::Disconnected
        );
        let snap = d.stats().snapshot();
        assert_eq!(snap.would_block, 1);
        assert_eq!(snap.sent, 1);
    }

    #[test]
    fn refused_keeps_running() {
        let mut d = dispatcher(ScriptedSink::failing_with([
            Err(Errno::CONNREFUSED),
            Err(Errno::NOENT),
            Err(Errno::CONNREFUSED),
        ]));
        let mut source = ListSource((0..3).map(|_| data(b"x")).collect());
        assert_eq!(
            d.run(&mut source, &CancelToken::new()),
            DispatchExit::Disconnected
        );
        assert_eq!(d.stats().snapshot().refused, 3);
        assert_eq!(d.stats().snapshot().sent, 0);
    }

    #[test]
    fn bad_handle_stops_the_loop() {
        let mut d = dispatcher(ScriptedSink::failing_with([Ok(1), Err(Errno::BADF)]));
        let mut source = ListSource(VecDeque::from([data(b"A"), data(b"B"), data(b"C")]));
        assert_eq!(
            d.run(&mut source, &CancelToken::new()),
            DispatchExit::Fatal(SendError::BadDescriptor(Errno::BADF))
        );
        // C was never taken from the source.
        assert_eq!(source.0.len(), 1);
        assert_eq!(d.sink().sent.len(), 2);
        assert_eq!(d.stats().snapshot().sent, 1);
    }

    #[test]
    fn unclassified_error_stops_the_loop() {
        let mut d = dispatcher(ScriptedSink::failing_with([Err(Errno::MSGSIZE)]));
        let mut source = ListSource(VecDeque::from([data(b"A")]));
        assert_eq!(
            d.run(&mut source, &CancelToken::new()),
            DispatchExit::Fatal(SendError::Other(Errno::MSGSIZE))
        );
    }

    #[test]
    fn mixed_sequence_sends_in_order() {
        let mut d = dispatcher(ScriptedSink::default());
        let mut source = ListSource(VecDeque::from([
            data(b"A"),
            Envelope::from(&b"garbage"[..]),
            data(b""),
            data(b"B"),
        ]));
        assert_eq!(
            d.run(&mut source, &CancelToken::new()),
            DispatchExit::Disconnected
        );

        let snap = d.stats().snapshot();
        assert_eq!(snap.sent, 2);
        assert_eq!(snap.decode_errors, 1);
        let (_, sink) = d.into_parts();
        assert_eq!(sink.sent, vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[test]
    fn cancelled_before_any_envelope() {
        let mut d = dispatcher(ScriptedSink::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut source = ListSource(VecDeque::from([data(b"A")]));
        assert_eq!(d.run(&mut source, &cancel), DispatchExit::Cancelled);
        assert!(d.sink().sent.is_empty());
    }

    #[test]
    fn short_send_counts_as_sent() {
        let mut d = dispatcher(ScriptedSink::failing_with([Ok(2)]));
        assert_eq!(d.dispatch(&data(b"ABCD")), Dispatched::Sent(2));
        assert_eq!(d.stats().snapshot().sent, 1);
    }
}
