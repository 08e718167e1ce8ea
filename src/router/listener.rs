//! Inbound side of the relay: accepts peer connections and dispatches the
//! updates they carry.
//!
//! Each accepted connection gets its own task.  The task reads into a
//! fixed-size buffer, feeds a [`LineBuffer`] so that a record split across
//! reads is reassembled, and hands every routable [`Update`] to the
//! [`Updater`].
//!
//! Lines that fail to decode are reported and skipped; the connection keeps
//! serving.  A peer that sends a line longer than `max_line_bytes` is
//! disconnected.
//!
//! [`Update`]: crate::types::Update

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::codec::{self, LineBuffer};
use crate::error::{RelayError, Result};
use crate::reporter::Reporter;
use crate::updater::Updater;

const TARGET: &str = "router";

/// Per-connection read settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadLimits {
    pub read_buffer: usize,
    pub max_line: usize,
}

/// Source of inbound peer connections.
#[async_trait]
pub(crate) trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// A bound listener that has not started accepting yet.
pub struct UpdateListener {
    listener: TcpListener,
    reporter: Arc<dyn Reporter>,
    limits: ReadLimits,
    accept_backoff: Duration,
}

impl UpdateListener {
    pub(crate) fn new(
        listener: TcpListener,
        reporter: Arc<dyn Reporter>,
        limits: ReadLimits,
        accept_backoff: Duration,
    ) -> Self {
        Self {
            listener,
            reporter,
            limits,
            accept_backoff,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts peers forever, one handler task per connection.
    pub async fn serve(self, updater: Arc<dyn Updater>) {
        accept_loop(
            &self.listener,
            self.reporter,
            self.limits,
            self.accept_backoff,
            updater,
        )
        .await
    }
}

/// Accept failures are reported and followed by a `backoff` pause; they
/// never stop the loop.
pub(crate) async fn accept_loop<A>(
    acceptor: &A,
    reporter: Arc<dyn Reporter>,
    limits: ReadLimits,
    backoff: Duration,
    updater: Arc<dyn Updater>,
) where
    A: Acceptor + ?Sized,
{
    loop {
        match acceptor.accept().await {
            Ok((stream, peer)) => {
                reporter.debug(TARGET, &format!("Accepted peer connection from {}", peer));
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&updater),
                    Arc::clone(&reporter),
                    limits,
                ));
            }
            Err(e) => {
                let e = RelayError::Accept(e);
                reporter.critical(TARGET, &e.to_string());
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Runs [`handle_connection`] and reports how it ended.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    updater: Arc<dyn Updater>,
    reporter: Arc<dyn Reporter>,
    limits: ReadLimits,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let served = handle_connection(stream, peer, updater.as_ref(), reporter.as_ref(), limits).await;
    if let Err(e) = served {
        reporter.error("updater", &format!("Error: update: {}", e));
    }
}

/// Serves one peer until it hangs up or fails.  The stream is shut down on
/// every exit path.
pub(crate) async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    updater: &dyn Updater,
    reporter: &dyn Reporter,
    limits: ReadLimits,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = read_updates(&mut stream, peer, updater, reporter, limits).await;
    let _ = stream.shutdown().await;
    result
}

async fn read_updates<S>(
    stream: &mut S,
    peer: SocketAddr,
    updater: &dyn Updater,
    reporter: &dyn Reporter,
    limits: ReadLimits,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; limits.read_buffer];
    let mut lines = LineBuffer::new(limits.max_line);

    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|source| RelayError::Read { peer, source })?;

        if n == 0 {
            if let Some(tail) = lines.finish() {
                dispatch(&tail, peer, updater, reporter).await;
            }
            reporter.debug(TARGET, &format!("Closing listener socket for {}", peer));
            return Ok(());
        }

        let complete = lines
            .push(&buf[..n])
            .map_err(|codec::LineTooLong| RelayError::LineTooLong {
                peer,
                limit: limits.max_line,
            })?;
        for line in complete {
            dispatch(&line, peer, updater, reporter).await;
        }
    }
}

async fn dispatch(line: &[u8], peer: SocketAddr, updater: &dyn Updater, reporter: &dyn Reporter) {
    let update = match codec::decode_line(line) {
        Ok(update) => update,
        Err(e) => {
            reporter.error(
                TARGET,
                &format!(
                    "Skipping line from {}: {} ({})",
                    peer,
                    e,
                    String::from_utf8_lossy(line)
                ),
            );
            return;
        }
    };

    if !update.is_routable() {
        reporter.debug(TARGET, &format!("Discarding update without client id from {}", peer));
        return;
    }

    reporter.debug(TARGET, &format!("Handling update {:?}", update));
    if let Err(e) = updater.update(update).await {
        reporter.error(TARGET, &format!("Updater failed for update from {}: {:#}", peer, e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::testing::RecordingReporter;
    use crate::types::Update;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    const LIMITS: ReadLimits = ReadLimits {
        read_buffer: 16,
        max_line: 256,
    };

    fn peer() -> SocketAddr {
        "10.0.0.1:3000".parse().unwrap()
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Update>>);

    impl Collect {
        fn taken(&self) -> Vec<Update> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Updater for Collect {
        async fn update(&self, update: Update) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(update);
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl Updater for Refuse {
        async fn update(&self, _update: Update) -> anyhow::Result<()> {
            Err(anyhow!("client not connected here"))
        }
    }

    async fn run(input: &[u8], updater: &dyn Updater, reporter: &RecordingReporter) -> Result<()> {
        let (mut client, server) = duplex(64);
        let input = input.to_vec();
        let writer = tokio::spawn(async move {
            // Small chunks so records straddle reads.
            for chunk in input.chunks(5) {
                if client.write_all(chunk).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });
        let result = handle_connection(server, peer(), updater, reporter, LIMITS).await;
        writer.await.unwrap();
        result
    }

    #[tokio::test]
    async fn dispatches_records_split_across_reads() {
        let updater = Collect::default();
        let reporter = RecordingReporter::default();
        let input = b"{\"uaid\":\"abc123\",\"chid\":\"chan1\",\"vers\":42}\n{\"uaid\":\"d\",\"chid\":\"e\",\"vers\":1}\n";

        run(input, &updater, &reporter).await.unwrap();
        assert_eq!(
            updater.taken(),
            vec![Update::new("abc123", "chan1", 42), Update::new("d", "e", 1)]
        );
    }

    #[tokio::test]
    async fn ignores_empty_lines_and_empty_client_ids() {
        let updater = Collect::default();
        let reporter = RecordingReporter::default();
        let input = b"\n\n{\"uaid\":\"\",\"chid\":\"x\",\"vers\":3}\n";

        run(input, &updater, &reporter).await.unwrap();
        assert!(updater.taken().is_empty());
    }

    #[tokio::test]
    async fn skips_undecodable_line_and_keeps_serving() {
        let updater = Collect::default();
        let reporter = RecordingReporter::default();
        let input = b"{\"uaid\":\"a\",\"chid\":\"x\",\"vers\":9}\nnot json\n{\"uaid\":\"b\"}\n";

        run(input, &updater, &reporter).await.unwrap();
        assert_eq!(
            updater.taken(),
            vec![Update::new("a", "x", 9), Update::new("b", "", 0)]
        );
        assert!(reporter.has("error", "Skipping line"));
    }

    #[tokio::test]
    async fn unterminated_tail_is_decoded_at_end_of_stream() {
        let updater = Collect::default();
        let reporter = RecordingReporter::default();

        run(b"{\"uaid\":\"z\",\"chid\":\"c\",\"vers\":5}", &updater, &reporter)
            .await
            .unwrap();
        assert_eq!(updater.taken(), vec![Update::new("z", "c", 5)]);
    }

    #[tokio::test]
    async fn updater_errors_are_reported() {
        let reporter = RecordingReporter::default();
        run(b"{\"uaid\":\"a\",\"chid\":\"x\",\"vers\":1}\n", &Refuse, &reporter)
            .await
            .unwrap();
        assert!(reporter.has("error", "client not connected here"));
    }

    #[tokio::test]
    async fn oversized_line_closes_connection() {
        let updater = Collect::default();
        let reporter = RecordingReporter::default();
        let input = vec![b'x'; LIMITS.max_line + 32];

        let err = run(&input, &updater, &reporter).await.unwrap_err();
        assert!(matches!(err, RelayError::LineTooLong { limit: 256, .. }));
    }

    /// Stream whose reads fail with a reset and which remembers being shut down.
    struct ResetStream {
        shut_down: Arc<AtomicBool>,
    }

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shut_down.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_failure_ends_handler_and_closes_stream() {
        let shut_down = Arc::new(AtomicBool::new(false));
        let stream = ResetStream {
            shut_down: Arc::clone(&shut_down),
        };
        let reporter = RecordingReporter::default();

        let err = handle_connection(stream, peer(), &Collect::default(), &reporter, LIMITS)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Read { ref source, .. } if source.kind() == io::ErrorKind::ConnectionReset
        ));
        assert!(shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn read_failure_is_reported_as_error() {
        let shut_down = Arc::new(AtomicBool::new(false));
        let stream = ResetStream {
            shut_down: Arc::clone(&shut_down),
        };
        let reporter = Arc::new(RecordingReporter::default());

        serve_connection(
            stream,
            peer(),
            Arc::new(Collect::default()),
            reporter.clone(),
            LIMITS,
        )
        .await;
        assert!(reporter.has("error", "Error: update: read from 10.0.0.1:3000 failed"));
        assert!(shut_down.load(Ordering::SeqCst));
    }

    /// Acceptor that always fails and counts how often it was asked.
    #[derive(Default)]
    struct FailingAcceptor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Acceptor for FailingAcceptor {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }
    }

    #[tokio::test]
    async fn accept_failures_back_off_instead_of_spinning() {
        let acceptor = FailingAcceptor::default();
        let reporter = Arc::new(RecordingReporter::default());

        let ran = tokio::time::timeout(
            Duration::from_millis(230),
            accept_loop(
                &acceptor,
                reporter.clone(),
                LIMITS,
                Duration::from_millis(50),
                Arc::new(Collect::default()),
            ),
        )
        .await;
        assert!(ran.is_err(), "accept loop must keep running after failures");

        // One attempt per 50ms pause: about five in 230ms, not thousands.
        let calls = acceptor.calls.load(Ordering::SeqCst);
        assert!((2..=6).contains(&calls), "unexpected accept attempts: {}", calls);
        assert!(reporter.has("critical", "could not accept connection: too many open files"));
    }
}
