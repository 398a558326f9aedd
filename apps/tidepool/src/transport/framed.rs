use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{CloseLatch, TransportError, is_disconnect};
use crate::protocol::wire::WireError;

/// Zero-length frame: liveness probe, invisible above the framing layer.
const KEEPALIVE_FRAME: [u8; 4] = 0i32.to_be_bytes();
/// Negative length: the peer is closing; the frame stream ends here.
const CLOSE_SENTINEL: [u8; 4] = (-1i32).to_be_bytes();

/// One frame as seen by the framing layer's caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Keepalive,
    Payload(Bytes),
}

/// A length-prefixed, duplex message channel over one TCP connection.
///
/// Frames are a signed 32-bit big-endian length followed by that many
/// payload bytes. Partial reads and writes never surface: the reader keeps
/// its progress across cancelled calls and the writer puts each frame on
/// the wire in one uncancellable critical section.
pub struct FramedSocket {
    peer: SocketAddr,
    reader: AsyncMutex<FrameReader>,
    writer: Arc<AsyncMutex<FrameWriter>>,
    closed: CloseLatch,
}

struct FrameReader {
    io: OwnedReadHalf,
    len_buf: [u8; 4],
    len_filled: usize,
    payload: Option<PartialPayload>,
}

struct PartialPayload {
    buf: Vec<u8>,
    filled: usize,
}

struct FrameWriter {
    io: OwnedWriteHalf,
}

enum RawFrame {
    Keepalive,
    Payload(Vec<u8>),
    PeerClosed,
}

impl FrameReader {
    /// Pulls the next frame, looping over short reads. Every await point is
    /// a plain `read`, so a cancelled call leaves `len_filled`/`payload`
    /// intact and the next call resumes mid-frame.
    async fn next(&mut self) -> std::io::Result<Option<RawFrame>> {
        if self.payload.is_none() {
            while self.len_filled < 4 {
                let n = self.io.read(&mut self.len_buf[self.len_filled..]).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.len_filled += n;
            }
            let len = i32::from_be_bytes(self.len_buf);
            self.len_filled = 0;
            if len == 0 {
                return Ok(Some(RawFrame::Keepalive));
            }
            if len < 0 {
                return Ok(Some(RawFrame::PeerClosed));
            }
            self.payload = Some(PartialPayload {
                buf: vec![0; len as usize],
                filled: 0,
            });
        }
        while let Some(partial) = self.payload.as_mut() {
            if partial.filled == partial.buf.len() {
                break;
            }
            let n = self.io.read(&mut partial.buf[partial.filled..]).await?;
            if n == 0 {
                return Ok(None);
            }
            partial.filled += n;
        }
        match self.payload.take() {
            Some(partial) => Ok(Some(RawFrame::Payload(partial.buf))),
            None => Ok(None),
        }
    }
}

impl FramedSocket {
    /// Wraps an open TCP connection. With `keepalive` set, a background task
    /// probes the peer at that interval until the socket closes.
    pub fn new(stream: TcpStream, keepalive: Option<Duration>) -> std::io::Result<Arc<Self>> {
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let socket = Arc::new(Self {
            peer,
            reader: AsyncMutex::new(FrameReader {
                io: read_half,
                len_buf: [0; 4],
                len_filled: 0,
                payload: None,
            }),
            writer: Arc::new(AsyncMutex::new(FrameWriter { io: write_half })),
            closed: CloseLatch::new(),
        });
        if let Some(period) = keepalive {
            spawn_keepalive(&socket, period);
        }
        Ok(socket)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_set()
    }

    pub(crate) fn close_latch(&self) -> &CloseLatch {
        &self.closed
    }

    pub async fn await_closed(&self) -> Result<(), TransportError> {
        self.closed.wait().await
    }

    /// Reads one frame.
    ///
    /// `Ok(None)` means the stream is over: the peer sent EOF or the
    /// peer-closed sentinel, or the connection died underneath us. I/O
    /// errors other than disconnection are recorded on the closed latch and
    /// propagated.
    pub async fn read_frame(&self) -> Result<Option<Frame>, TransportError> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Ok(Some(RawFrame::Keepalive)) => Ok(Some(Frame::Keepalive)),
            Ok(Some(RawFrame::Payload(buf))) => Ok(Some(Frame::Payload(Bytes::from(buf)))),
            Ok(Some(RawFrame::PeerClosed)) => {
                debug!(
                    target = "tidepool::transport::framed",
                    peer = %self.peer,
                    "peer sent close sentinel"
                );
                self.closed.set(Ok(()));
                Ok(None)
            }
            Ok(None) => {
                self.closed.set(Ok(()));
                Ok(None)
            }
            Err(err) if is_disconnect(&err) => {
                info!(
                    target = "tidepool::transport::framed",
                    peer = %self.peer,
                    error = %err,
                    "socket closed during read"
                );
                self.closed.set(Ok(()));
                Ok(None)
            }
            Err(err) => {
                let mapped = TransportError::from(err);
                self.closed.set(Err(mapped.clone()));
                Err(mapped)
            }
        }
    }

    /// Writes one frame: length prefix and payload, contiguous on the wire.
    ///
    /// The write runs on its own task so cancelling the caller cannot leave
    /// a half-written frame behind. Writers are serialized on the write
    /// mutex; errors record on the closed latch and tear the socket down.
    pub async fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_set() {
            return Err(TransportError::ChannelClosed);
        }
        if payload.len() > i32::MAX as usize {
            return Err(TransportError::Encode(WireError::InvalidData(
                "frame exceeds signed 32-bit length",
            )));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        frame.extend_from_slice(payload);

        let writer = Arc::clone(&self.writer);
        let closed = self.closed.clone();
        let peer = self.peer;
        let handle = tokio::spawn(async move {
            let mut guard = writer.lock().await;
            match guard.io.write_all(&frame).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let mapped = TransportError::from(err);
                    debug!(
                        target = "tidepool::transport::framed",
                        peer = %peer,
                        error = %mapped,
                        "frame write failed; closing socket"
                    );
                    closed.set(Err(mapped.clone()));
                    let _ = guard.io.shutdown().await;
                    Err(mapped)
                }
            }
        });
        handle
            .await
            .map_err(|err| TransportError::Io(format!("write task failed: {err}")))?
    }

    /// Probes the peer with a zero-length frame. If a real write holds the
    /// mutex the probe is skipped; that write is proof of life already.
    pub async fn send_keepalive(&self) -> Result<(), TransportError> {
        if self.closed.is_set() {
            return Err(TransportError::ChannelClosed);
        }
        let Ok(mut guard) = self.writer.try_lock() else {
            trace!(
                target = "tidepool::transport::framed",
                peer = %self.peer,
                "write in flight; skipping keepalive"
            );
            return Ok(());
        };
        match guard.io.write_all(&KEEPALIVE_FRAME).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mapped = TransportError::from(err);
                self.closed.set(Err(mapped.clone()));
                let _ = guard.io.shutdown().await;
                Err(mapped)
            }
        }
    }

    /// Closes the socket: best-effort close sentinel to the peer, then
    /// socket shutdown, then the latch. Runs to completion even if the
    /// caller is cancelled. Idempotent once the latch is set.
    pub async fn close(&self) {
        if self.closed.is_set() {
            return;
        }
        let writer = Arc::clone(&self.writer);
        let closed = self.closed.clone();
        let handle = tokio::spawn(async move {
            let mut guard = writer.lock().await;
            let _ = guard.io.write_all(&CLOSE_SENTINEL).await;
            let _ = guard.io.shutdown().await;
            closed.set(Ok(()));
        });
        if let Err(err) = handle.await {
            warn!(
                target = "tidepool::transport::framed",
                peer = %self.peer,
                error = %err,
                "close task failed"
            );
        }
    }

    /// Next payload frame, silently skipping keepalives. Returns `None` once
    /// the frame stream is over or the closed latch fires; pump errors are
    /// already recorded on the latch by `read_frame`.
    pub async fn next_payload(&self) -> Option<Bytes> {
        loop {
            tokio::select! {
                _ = self.closed.wait() => return None,
                frame = self.read_frame() => match frame {
                    Ok(Some(Frame::Payload(payload))) => return Some(payload),
                    Ok(Some(Frame::Keepalive)) => continue,
                    Ok(None) => return None,
                    Err(err) => {
                        warn!(
                            target = "tidepool::transport::framed",
                            peer = %self.peer,
                            error = %err,
                            "frame stream failed"
                        );
                        return None;
                    }
                },
            }
        }
    }

    /// The payload frames as a lazy stream.
    pub fn frames(self: &Arc<Self>) -> impl Stream<Item = Bytes> + use<> {
        let socket = Arc::clone(self);
        stream::unfold(socket, |socket| async move {
            socket.next_payload().await.map(|payload| (payload, socket))
        })
    }
}

fn spawn_keepalive(socket: &Arc<FramedSocket>, period: Duration) {
    let latch = socket.closed.clone();
    let weak: Weak<FramedSocket> = Arc::downgrade(socket);
    let peer = socket.peer;
    tokio::spawn(async move {
        // First tick is one full period out so the channel tag stays the
        // first frame on a fresh connection.
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = latch.wait() => break,
                _ = ticker.tick() => {
                    let Some(socket) = weak.upgrade() else {
                        break;
                    };
                    if let Err(err) = socket.send_keepalive().await {
                        debug!(
                            target = "tidepool::transport::framed",
                            peer = %peer,
                            error = %err,
                            "keepalive failed; socket closed"
                        );
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (accepted, _) = accepted.expect("accept");
        (accepted, connected.expect("connect"))
    }

    async fn framed_pair() -> (Arc<FramedSocket>, Arc<FramedSocket>) {
        let (left, right) = tcp_pair().await;
        (
            FramedSocket::new(left, None).expect("wrap left"),
            FramedSocket::new(right, None).expect("wrap right"),
        )
    }

    #[tokio::test]
    async fn round_trips_payloads_in_order() {
        let (a, b) = framed_pair().await;
        let payloads: Vec<Vec<u8>> = vec![
            vec![42],
            (0..=255).collect(),
            vec![7; 100_000],
        ];
        for payload in &payloads {
            a.write(payload).await.expect("write");
        }
        for payload in &payloads {
            let frame = b.read_frame().await.expect("read").expect("frame");
            assert_eq!(frame, Frame::Payload(Bytes::from(payload.clone())));
        }
    }

    #[tokio::test]
    async fn partial_writes_are_invisible() {
        let (raw, framed_stream) = tcp_pair().await;
        let framed = FramedSocket::new(framed_stream, None).expect("wrap");
        let payload = vec![9u8; 1000];
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        wire.extend_from_slice(&payload);

        let writer = tokio::spawn(async move {
            let mut raw = raw;
            for chunk in wire.chunks(7) {
                raw.write_all(chunk).await.expect("chunk write");
                raw.flush().await.expect("flush");
                sleep(Duration::from_millis(1)).await;
            }
            raw
        });

        let frame = timeout(Duration::from_secs(5), framed.read_frame())
            .await
            .expect("read in time")
            .expect("read")
            .expect("frame");
        assert_eq!(frame, Frame::Payload(Bytes::from(payload)));
        writer.await.expect("writer task");
    }

    #[tokio::test]
    async fn keepalives_are_skipped_by_payload_stream() {
        let (mut raw, framed_stream) = tcp_pair().await;
        let framed = FramedSocket::new(framed_stream, None).expect("wrap");
        raw.write_all(&KEEPALIVE_FRAME).await.expect("keepalive");
        raw.write_all(&KEEPALIVE_FRAME).await.expect("keepalive");
        let payload = b"after keepalives".to_vec();
        raw.write_all(&(payload.len() as i32).to_be_bytes())
            .await
            .expect("length");
        raw.write_all(&payload).await.expect("payload");

        let delivered = timeout(Duration::from_secs(5), framed.next_payload())
            .await
            .expect("payload in time")
            .expect("payload");
        assert_eq!(delivered, Bytes::from(payload));
    }

    #[tokio::test]
    async fn keepalive_frame_visible_to_read_frame() {
        let (mut raw, framed_stream) = tcp_pair().await;
        let framed = FramedSocket::new(framed_stream, None).expect("wrap");
        raw.write_all(&KEEPALIVE_FRAME).await.expect("keepalive");
        let frame = framed.read_frame().await.expect("read").expect("frame");
        assert_eq!(frame, Frame::Keepalive);
    }

    #[tokio::test]
    async fn negative_length_terminates_stream() {
        let (mut raw, framed_stream) = tcp_pair().await;
        let framed = FramedSocket::new(framed_stream, None).expect("wrap");
        raw.write_all(&CLOSE_SENTINEL).await.expect("sentinel");
        let frame = framed.read_frame().await.expect("read");
        assert!(frame.is_none());
        assert!(!framed.is_connected());
        assert!(framed.await_closed().await.is_ok());
    }

    #[tokio::test]
    async fn eof_terminates_stream() {
        let (raw, framed_stream) = tcp_pair().await;
        let framed = FramedSocket::new(framed_stream, None).expect("wrap");
        drop(raw);
        let frame = timeout(Duration::from_secs(5), framed.read_frame())
            .await
            .expect("read in time")
            .expect("read");
        assert!(frame.is_none());
        assert!(!framed.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_peer() {
        let (a, b) = framed_pair().await;
        a.close().await;
        a.close().await;
        assert!(!a.is_connected());
        assert!(a.await_closed().await.is_ok());
        let frame = timeout(Duration::from_secs(5), b.read_frame())
            .await
            .expect("read in time")
            .expect("read");
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn cancelled_read_resumes_mid_frame() {
        let (mut raw, framed_stream) = tcp_pair().await;
        let framed = FramedSocket::new(framed_stream, None).expect("wrap");
        let payload = vec![3u8; 64];
        raw.write_all(&(payload.len() as i32).to_be_bytes())
            .await
            .expect("length");
        raw.write_all(&payload[..20]).await.expect("first half");
        raw.flush().await.expect("flush");

        // Cancel a read while the payload is only partially on the wire.
        let cancelled = timeout(Duration::from_millis(50), framed.read_frame()).await;
        assert!(cancelled.is_err());

        raw.write_all(&payload[20..]).await.expect("second half");
        let frame = timeout(Duration::from_secs(5), framed.read_frame())
            .await
            .expect("read in time")
            .expect("read")
            .expect("frame");
        assert_eq!(frame, Frame::Payload(Bytes::from(payload.clone())));

        // Frame order survives the cancelled call.
        raw.write_all(&(1i32).to_be_bytes()).await.expect("length");
        raw.write_all(&[0xAB]).await.expect("byte");
        let frame = framed.read_frame().await.expect("read").expect("frame");
        assert_eq!(frame, Frame::Payload(Bytes::from_static(&[0xAB])));
    }

    #[tokio::test]
    async fn cancelled_write_still_reaches_wire() {
        let (a, b) = framed_pair().await;
        let payload = vec![5u8; 50_000];
        // Zero timeout polls the write once (spawning the critical section)
        // and then cancels the caller.
        let _ = timeout(Duration::ZERO, a.write(&payload)).await;
        let frame = timeout(Duration::from_secs(5), b.read_frame())
            .await
            .expect("read in time")
            .expect("read")
            .expect("frame");
        assert_eq!(frame, Frame::Payload(Bytes::from(payload)));
    }

    #[tokio::test]
    async fn concurrent_writes_never_interleave() {
        let (a, b) = framed_pair().await;
        let mut tasks = Vec::new();
        for i in 0u8..8 {
            let socket = Arc::clone(&a);
            tasks.push(tokio::spawn(async move {
                let payload = vec![i; 1000 + i as usize * 3000];
                socket.write(&payload).await.expect("write");
            }));
        }
        for task in tasks {
            task.await.expect("writer task");
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            let payload = timeout(Duration::from_secs(5), b.next_payload())
                .await
                .expect("payload in time")
                .expect("payload");
            // An intact frame is uniform; interleaved writes would mix fills.
            assert!(payload.iter().all(|byte| *byte == payload[0]));
            assert_eq!(payload.len(), 1000 + payload[0] as usize * 3000);
            seen.push(payload[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0u8..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn keepalive_task_probes_idle_peer() {
        let (raw, framed_stream) = tcp_pair().await;
        let framed =
            FramedSocket::new(framed_stream, Some(Duration::from_millis(10))).expect("wrap");
        let mut raw = raw;
        let mut len_buf = [0u8; 4];
        raw.read_exact(&mut len_buf).await.expect("probe");
        assert_eq!(len_buf, KEEPALIVE_FRAME);
        drop(framed);
    }

    #[tokio::test]
    async fn keepalive_detects_vanished_peer() {
        let (raw, framed_stream) = tcp_pair().await;
        let framed =
            FramedSocket::new(framed_stream, Some(Duration::from_millis(10))).expect("wrap");
        drop(raw);
        let result = timeout(Duration::from_secs(2), framed.await_closed())
            .await
            .expect("latch in time");
        assert!(result.is_err());
        assert!(!framed.is_connected());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (a, _b) = framed_pair().await;
        a.close().await;
        let result = a.write(b"too late").await;
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
    }
}
