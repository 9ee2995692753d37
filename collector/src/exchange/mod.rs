//! The exchange between the privileged producer and the collecting consumer.
//!
//! Both ends live in different processes and talk over a connected Unix
//! stream socket. The consumer announces readiness once; the producer then
//! pushes records followed by a single sentinel. Capacity is bounded by
//! credits: the producer may have at most [`CHANNEL_CAPACITY`] items
//! (records or the sentinel) that the consumer has not acknowledged yet.
//!
//! Every wait is bounded by a timeout and both ends can [`drain`] without
//! blocking, so neither side can leave the other stuck.
//!
//! [`drain`]: Consumer::drain

pub mod codec;

use crate::error::{Error, Result};
use codec::{decode, encode, Frame, TAG_ACK, TAG_READY};
use model::Record;
use nix::sys::socket::{recv, send, MsgFlags};
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Items the producer may have in flight.
pub const CHANNEL_CAPACITY: usize = 5;

const READ_CHUNK: usize = 64 * 1024;

/// Create the socket pair before the workers are started.
///
/// Returns `(producer_end, consumer_end)`.
pub fn socket_pair() -> Result<(StdUnixStream, StdUnixStream)> {
    Ok(StdUnixStream::pair()?)
}

/// Create both ends inside the current runtime.
pub fn pair() -> Result<(Producer, Consumer)> {
    let (producer, consumer) = UnixStream::pair()?;
    Ok((Producer::new(producer), Consumer::new(consumer)))
}

fn into_tokio(stream: StdUnixStream) -> Result<UnixStream> {
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// Read what the socket holds right now, bypassing the runtime's readiness
/// cache which may not have seen the data yet.
fn recv_now(stream: &UnixStream, buf: &mut [u8]) -> std::io::Result<usize> {
    recv(stream.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT).map_err(std::io::Error::from)
}

fn send_now(stream: &UnixStream, bytes: &[u8]) -> std::io::Result<usize> {
    send(stream.as_raw_fd(), bytes, MsgFlags::MSG_DONTWAIT).map_err(std::io::Error::from)
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected | ErrorKind::UnexpectedEof
    )
}

/// Sending end, held by the privileged worker.
#[derive(Debug)]
pub struct Producer {
    stream: UnixStream,
    capacity: usize,
    in_flight: usize,
    ready: bool,
    done: bool,
    broken: bool,
    sent: usize,
}

impl Producer {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            capacity: CHANNEL_CAPACITY,
            in_flight: 0,
            ready: false,
            done: false,
            broken: false,
            sent: 0,
        }
    }

    /// Wrap the producer end of [`socket_pair`]. Needs a running runtime.
    pub fn from_std(stream: StdUnixStream) -> Result<Self> {
        Ok(Self::new(into_tokio(stream)?))
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Records sent so far, not counting the sentinel.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Wait for the consumer's ready signal.
    ///
    /// Returns `false` when it did not arrive within `timeout`.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while !self.ready {
            match self.read_control(deadline).await {
                Ok(()) => {}
                Err(Error::ChannelFull(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Push one record, waiting up to `timeout` for room.
    pub async fn send(&mut self, record: Record, timeout: Duration) -> Result<()> {
        if self.done {
            return Err(Error::Protocol(format!(
                "record {} sent after the sentinel",
                record.name()
            )));
        }
        let name = record.name().to_string();
        self.push(Frame::Entry(record), timeout).await?;
        self.sent += 1;
        trace!(name = %name, in_flight = self.in_flight, "Record sent");
        Ok(())
    }

    /// Send the sentinel. Calling it again is a no-op.
    pub async fn send_done(&mut self, timeout: Duration) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.push(Frame::Done, timeout).await?;
        self.done = true;
        debug!(records = self.sent, "Sentinel sent");
        Ok(())
    }

    async fn push(&mut self, frame: Frame, timeout: Duration) -> Result<()> {
        if self.broken {
            return Err(Error::ChannelClosed);
        }
        let deadline = Instant::now() + timeout;

        self.poll_control()?;
        while self.in_flight >= self.capacity {
            if let Err(e) = self.read_control(deadline).await {
                self.broken = true;
                return Err(match e {
                    Error::ChannelFull(_) => Error::ChannelFull(timeout),
                    other => other,
                });
            }
        }

        let bytes = encode(&frame)?;
        match timeout_at(deadline, self.stream.write_all(&bytes)).await {
            Ok(Ok(())) => {
                self.in_flight += 1;
                Ok(())
            }
            Ok(Err(e)) => {
                self.broken = true;
                if is_disconnect(&e) {
                    Err(Error::ChannelClosed)
                } else {
                    Err(e.into())
                }
            }
            Err(_) => {
                self.broken = true;
                Err(Error::ChannelFull(timeout))
            }
        }
    }

    /// Read one control byte, waiting until `deadline`.
    ///
    /// An expired deadline is reported as `ChannelFull`.
    async fn read_control(&mut self, deadline: Instant) -> Result<()> {
        let mut byte = [0u8; 1];
        match timeout_at(deadline, self.stream.read(&mut byte)).await {
            Ok(Ok(0)) => Err(Error::ChannelClosed),
            Ok(Ok(_)) => self.apply_control(byte[0]),
            Ok(Err(e)) if is_disconnect(&e) => Err(Error::ChannelClosed),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::ChannelFull(Duration::ZERO)),
        }
    }

    /// Consume control bytes that are already available.
    fn poll_control(&mut self) -> Result<usize> {
        let mut buf = [0u8; 64];
        let mut seen = 0;
        loop {
            match recv_now(&self.stream, &mut buf) {
                Ok(0) => return Ok(seen),
                Ok(n) => {
                    for byte in &buf[..n] {
                        self.apply_control(*byte)?;
                    }
                    seen += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(seen),
                Err(e) if is_disconnect(&e) => return Ok(seen),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn apply_control(&mut self, byte: u8) -> Result<()> {
        match byte {
            TAG_READY => {
                self.ready = true;
                Ok(())
            }
            TAG_ACK => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected control byte 0x{:02x}",
                other
            ))),
        }
    }

    /// Discard pending control traffic without blocking.
    pub fn drain(&mut self) -> usize {
        match self.poll_control() {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Drain stopped on error");
                0
            }
        }
    }
}

/// What the consumer got from [`Consumer::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Record(Record),
    /// The sentinel: nothing follows
    Done,
}

/// Receiving end, held by the collecting worker.
#[derive(Debug)]
pub struct Consumer {
    stream: UnixStream,
    buf: Vec<u8>,
    ready_sent: bool,
    finished: bool,
    received: usize,
}

impl Consumer {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            ready_sent: false,
            finished: false,
            received: 0,
        }
    }

    /// Wrap the consumer end of [`socket_pair`]. Needs a running runtime.
    pub fn from_std(stream: StdUnixStream) -> Result<Self> {
        Ok(Self::new(into_tokio(stream)?))
    }

    /// Records received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Tell the producer to start sending. Only the first call has an effect.
    pub async fn signal_ready(&mut self) -> Result<()> {
        if self.ready_sent {
            return Ok(());
        }
        match self.stream.write_all(&[TAG_READY]).await {
            Ok(()) => {
                self.ready_sent = true;
                debug!("Signalled ready");
                Ok(())
            }
            Err(e) if is_disconnect(&e) => Err(Error::ChannelClosed),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the next item, waiting at most `timeout`.
    ///
    /// Fails with `ChannelEmpty` on timeout and `ChannelClosed` when the
    /// producer went away without a sentinel. Safe to cancel: partially
    /// received frames stay buffered.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Message> {
        if self.finished {
            return Ok(Message::Done);
        }
        let deadline = Instant::now() + timeout;

        loop {
            if let Some((frame, used)) = decode(&self.buf)? {
                self.buf.drain(..used);
                return match frame {
                    Frame::Entry(record) => {
                        self.received += 1;
                        self.ack().await;
                        Ok(Message::Record(record))
                    }
                    Frame::Done => {
                        self.finished = true;
                        self.ack().await;
                        Ok(Message::Done)
                    }
                    other => Err(Error::Protocol(format!("unexpected frame {:?}", other))),
                };
            }

            let mut chunk = vec![0u8; READ_CHUNK];
            match timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    if !self.buf.is_empty() {
                        warn!(bytes = self.buf.len(), "Producer closed mid-frame");
                    }
                    return Err(Error::ChannelClosed);
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) if is_disconnect(&e) => return Err(Error::ChannelClosed),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(Error::ChannelEmpty(timeout)),
            }
        }
    }

    async fn ack(&mut self) {
        if let Err(e) = self.stream.write_all(&[TAG_ACK]).await {
            debug!(error = %e, "Acknowledgement not delivered");
        }
    }

    /// Discard everything that can be read without blocking.
    ///
    /// Discarded items are acknowledged so a producer waiting for room is
    /// released. Returns the number of records discarded.
    pub fn drain(&mut self) -> usize {
        let mut discarded = 0;
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            while let Ok(Some((frame, used))) = decode(&self.buf) {
                self.buf.drain(..used);
                match frame {
                    Frame::Entry(record) => {
                        debug!(name = %record.name(), "Discarding record");
                        discarded += 1;
                    }
                    Frame::Done => self.finished = true,
                    _ => {}
                }
                let _ = send_now(&self.stream, &[TAG_ACK]);
            }

            match recv_now(&self.stream, &mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        if discarded > 0 {
            warn!(records = discarded, "Discarded records left in the exchange");
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use model::Status;

    const SHORT: Duration = Duration::from_millis(200);

    fn record(n: usize) -> Record {
        Record::new(format!("cmd_root/item{}.jsonp", n), Status::Ok).with_payload(format!("payload {}", n))
    }

    #[tokio::test]
    async fn test_ready_handshake() {
        let (mut producer, mut consumer) = pair().unwrap();
        assert!(!producer.wait_ready(SHORT).await.unwrap());
        consumer.signal_ready().await.unwrap();
        consumer.signal_ready().await.unwrap();
        assert!(producer.wait_ready(SHORT).await.unwrap());
        assert!(producer.is_ready());
    }

    #[tokio::test]
    async fn test_send_done_is_idempotent() {
        let (mut producer, mut consumer) = pair().unwrap();
        producer.send_done(SHORT).await.unwrap();
        producer.send_done(SHORT).await.unwrap();
        assert_eq!(consumer.receive(SHORT).await.unwrap(), Message::Done);
        assert_matches!(consumer.receive(SHORT).await, Ok(Message::Done));
    }

    #[tokio::test]
    async fn test_send_after_done_is_protocol_error() {
        let (mut producer, _consumer) = pair().unwrap();
        producer.send_done(SHORT).await.unwrap();
        assert_matches!(producer.send(record(1), SHORT).await, Err(Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (mut producer, mut consumer) = pair().unwrap();
        for n in 0..CHANNEL_CAPACITY {
            producer.send(record(n), SHORT).await.unwrap();
        }
        assert_matches!(producer.send(record(99), SHORT).await, Err(Error::ChannelFull(_)));
        assert_matches!(producer.send_done(Duration::ZERO).await, Err(Error::ChannelClosed));

        // The consumer still sees the records that made it and never hangs.
        for n in 0..CHANNEL_CAPACITY {
            assert_matches!(
                consumer.receive(SHORT).await,
                Ok(Message::Record(r)) if r.name() == record(n).name() && r.payload() == record(n).payload()
            );
        }
        assert_matches!(consumer.receive(SHORT).await, Err(Error::ChannelEmpty(_)));
    }

    #[tokio::test]
    async fn test_ack_frees_a_slot() {
        let (mut producer, mut consumer) = pair().unwrap();
        for n in 0..CHANNEL_CAPACITY {
            producer.send(record(n), SHORT).await.unwrap();
        }
        consumer.receive(SHORT).await.unwrap();
        producer.send(record(5), SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn test_sentinel_takes_a_slot() {
        let (mut producer, _consumer) = pair().unwrap();
        for n in 0..CHANNEL_CAPACITY {
            producer.send(record(n), SHORT).await.unwrap();
        }
        assert_matches!(producer.send_done(SHORT).await, Err(Error::ChannelFull(_)));
        assert!(!producer.is_done());
    }

    #[tokio::test]
    async fn test_consumer_sees_closed_producer() {
        let (producer, mut consumer) = pair().unwrap();
        drop(producer);
        assert_matches!(consumer.receive(SHORT).await, Err(Error::ChannelClosed));
    }

    #[tokio::test]
    async fn test_producer_sees_closed_consumer() {
        let (mut producer, consumer) = pair().unwrap();
        drop(consumer);
        assert_matches!(producer.wait_ready(SHORT).await, Err(Error::ChannelClosed));
    }

    #[tokio::test]
    async fn test_consumer_drain_releases_producer() {
        let (mut producer, mut consumer) = pair().unwrap();
        for n in 0..CHANNEL_CAPACITY {
            producer.send(record(n), SHORT).await.unwrap();
        }
        assert_eq!(consumer.drain(), CHANNEL_CAPACITY);
        producer.send_done(SHORT).await.unwrap();
        assert_eq!(consumer.drain(), 0);
        assert!(consumer.is_finished());
        assert_eq!(producer.drain(), 1);
    }
}
