use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::Stream;
use futures_util::stream;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::framed::{Frame, FramedSocket};
use super::{CloseLatch, TransportError};
use crate::config::TransportConfig;
use crate::kernel::{Deploy, DeployedProcess};
use crate::protocol::{ChannelRole, NotebookUpdate, RemoteRequest, RemoteResponse, wire};

/// Observer for kernel startup progress; the notebook task manager plugs in
/// here.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64, detail: &str);
}

/// Progress sink that just logs.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, fraction: f64, detail: &str) {
        info!(
            target = "tidepool::transport::socket",
            progress = fraction,
            detail,
            "kernel startup progress"
        );
    }
}

/// The two identified kernel channels plus the peer's address.
#[derive(Clone)]
pub struct ChannelPair {
    main: Arc<FramedSocket>,
    updates: Arc<FramedSocket>,
    peer: SocketAddr,
}

impl ChannelPair {
    fn new(main: Arc<FramedSocket>, updates: Arc<FramedSocket>) -> Self {
        let peer = main.peer_addr();
        Self {
            main,
            updates,
            peer,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.main.is_connected() && self.updates.is_connected()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn close(&self) {
        tokio::join!(self.main.close(), self.updates.close());
    }
}

/// Server half of the kernel transport. Owns the listener, the deployed
/// process and the channel pair; the first of {channel death, process exit,
/// explicit close} trips the closed latch and a single release pass tears
/// everything down.
pub struct TransportServer {
    local_addr: SocketAddr,
    process: DeployedProcess,
    channels: ChannelPair,
    closed: CloseLatch,
    released: CloseLatch,
}

impl TransportServer {
    fn new(
        listener: TcpListener,
        local_addr: SocketAddr,
        process: DeployedProcess,
        channels: ChannelPair,
        config: &TransportConfig,
    ) -> Self {
        let closed = CloseLatch::new();
        let released = CloseLatch::new();

        for (channel, name) in [(&channels.main, "main"), (&channels.updates, "updates")] {
            let latch = channel.close_latch().clone();
            let server_latch = closed.clone();
            tokio::spawn(async move {
                let result = latch.wait().await;
                if server_latch.set(result.clone()) {
                    match result {
                        Ok(()) => info!(
                            target = "tidepool::transport::socket",
                            channel = name,
                            "kernel channel closed; shutting down transport"
                        ),
                        Err(err) => warn!(
                            target = "tidepool::transport::socket",
                            channel = name,
                            error = %err,
                            "kernel channel failed; shutting down transport"
                        ),
                    }
                }
            });
        }

        {
            let process = process.clone();
            let server_latch = closed.clone();
            tokio::spawn(async move {
                let code = process.wait_exit().await;
                if server_latch.set(Err(TransportError::Process(format!(
                    "kernel process exited with status {code}"
                )))) {
                    warn!(
                        target = "tidepool::transport::socket",
                        pid = process.pid(),
                        code,
                        "kernel process died; shutting down transport"
                    );
                }
            });
        }

        // Single release pass: whoever trips the latch, resources go exactly
        // once. The listener lives here until then.
        {
            let channels = channels.clone();
            let process = process.clone();
            let closed = closed.clone();
            let released = released.clone();
            let grace = config.shutdown_grace;
            tokio::spawn(async move {
                let _ = closed.wait().await;
                channels.close().await;
                drop(listener);
                let outcome = process.await_or_kill(grace).await;
                match &outcome {
                    Ok(code) => info!(
                        target = "tidepool::transport::socket",
                        pid = process.pid(),
                        code,
                        "kernel transport released"
                    ),
                    Err(err) => warn!(
                        target = "tidepool::transport::socket",
                        pid = process.pid(),
                        error = %err,
                        "kernel transport release failed"
                    ),
                }
                released.set(outcome.map(|_| ()));
            });
        }

        Self {
            local_addr,
            process,
            channels,
            closed,
            released,
        }
    }

    /// Address of the listening socket the kernel was told to dial.
    pub fn address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn process(&self) -> &DeployedProcess {
        &self.process
    }

    pub fn is_connected(&self) -> bool {
        self.channels.is_connected()
    }

    pub async fn send_request(&self, request: &RemoteRequest) -> Result<(), TransportError> {
        let bytes = wire::encode_request(request);
        self.channels.main.write(&bytes).await.inspect_err(|err| match err {
            TransportError::Encode(_) => warn!(
                target = "tidepool::transport::socket",
                req_id = request.req_id(),
                error = %err,
                "request could not be framed"
            ),
            _ => warn!(
                target = "tidepool::transport::socket",
                req_id = request.req_id(),
                error = %err,
                "failed to send request; kernel has likely died"
            ),
        })
    }

    pub async fn send_notebook_update(&self, update: &NotebookUpdate) -> Result<(), TransportError> {
        let bytes = wire::encode_update(update);
        self.channels.updates.write(&bytes).await.inspect_err(|err| match err {
            TransportError::Encode(_) => warn!(
                target = "tidepool::transport::socket",
                error = %err,
                "notebook update could not be framed"
            ),
            _ => warn!(
                target = "tidepool::transport::socket",
                error = %err,
                "failed to send notebook update; kernel has likely died"
            ),
        })
    }

    /// Next kernel response off the main channel. `Ok(None)` once the
    /// transport is down; a decode failure ends this stream but not the
    /// transport.
    pub async fn next_response(&self) -> Result<Option<RemoteResponse>, TransportError> {
        let Some(payload) = self.channels.main.next_payload().await else {
            return Ok(None);
        };
        match wire::decode_response(&payload) {
            Ok(response) => Ok(Some(response)),
            Err(err) => {
                warn!(
                    target = "tidepool::transport::socket",
                    error = %err,
                    "undecodable kernel response; response stream ends"
                );
                Err(TransportError::Decode(err))
            }
        }
    }

    pub fn responses(&self) -> impl Stream<Item = RemoteResponse> + '_ {
        stream::unfold(self, |server| async move {
            match server.next_response().await {
                Ok(Some(response)) => Some((response, server)),
                Ok(None) | Err(_) => None,
            }
        })
    }

    /// Shuts the transport down: latch, channels, then the kernel process
    /// with a grace period before it is killed. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.closed.set(Ok(()));
        self.released.wait().await
    }

    pub async fn await_closed(&self) -> Result<(), TransportError> {
        self.closed.wait().await
    }
}

/// Kernel-side half of the transport.
pub struct TransportClient {
    channels: ChannelPair,
    closed: CloseLatch,
    released: CloseLatch,
    shutdown_seen: AtomicBool,
}

impl TransportClient {
    fn new(channels: ChannelPair) -> Self {
        let closed = CloseLatch::new();
        let released = CloseLatch::new();

        for channel in [&channels.main, &channels.updates] {
            let latch = channel.close_latch().clone();
            let client_latch = closed.clone();
            tokio::spawn(async move {
                let result = latch.wait().await;
                client_latch.set(result);
            });
        }

        {
            let channels = channels.clone();
            let closed = closed.clone();
            let released = released.clone();
            tokio::spawn(async move {
                let _ = closed.wait().await;
                channels.close().await;
                released.set(Ok(()));
            });
        }

        Self {
            channels,
            closed,
            released,
            shutdown_seen: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channels.is_connected()
    }

    pub async fn send_response(&self, response: &RemoteResponse) -> Result<(), TransportError> {
        let bytes = wire::encode_response(response);
        self.channels.main.write(&bytes).await.inspect_err(|err| match err {
            TransportError::Encode(_) => warn!(
                target = "tidepool::transport::socket",
                error = %err,
                "response could not be framed"
            ),
            _ => warn!(
                target = "tidepool::transport::socket",
                error = %err,
                "failed to send response; server has likely died"
            ),
        })
    }

    /// Next server request off the main channel. The stream ends after a
    /// shutdown request has been delivered: the kernel acknowledges and
    /// stops reading.
    pub async fn next_request(&self) -> Result<Option<RemoteRequest>, TransportError> {
        if self.shutdown_seen.load(Ordering::Acquire) {
            return Ok(None);
        }
        let Some(payload) = self.channels.main.next_payload().await else {
            return Ok(None);
        };
        match wire::decode_request(&payload) {
            Ok(request) => {
                if request.is_shutdown() {
                    self.shutdown_seen.store(true, Ordering::Release);
                }
                Ok(Some(request))
            }
            Err(err) => {
                warn!(
                    target = "tidepool::transport::socket",
                    error = %err,
                    "undecodable server request; request stream ends"
                );
                Err(TransportError::Decode(err))
            }
        }
    }

    pub fn requests(&self) -> impl Stream<Item = RemoteRequest> + '_ {
        stream::unfold(self, |client| async move {
            match client.next_request().await {
                Ok(Some(request)) => Some((request, client)),
                Ok(None) | Err(_) => None,
            }
        })
    }

    /// Next notebook update off the updates channel.
    pub async fn next_update(&self) -> Result<Option<NotebookUpdate>, TransportError> {
        let Some(payload) = self.channels.updates.next_payload().await else {
            return Ok(None);
        };
        match wire::decode_update(&payload) {
            Ok(update) => Ok(Some(update)),
            Err(err) => {
                warn!(
                    target = "tidepool::transport::socket",
                    error = %err,
                    "undecodable notebook update; update stream ends"
                );
                Err(TransportError::Decode(err))
            }
        }
    }

    pub fn updates(&self) -> impl Stream<Item = NotebookUpdate> + '_ {
        stream::unfold(self, |client| async move {
            match client.next_update().await {
                Ok(Some(update)) => Some((update, client)),
                Ok(None) | Err(_) => None,
            }
        })
    }

    pub async fn close(&self) {
        self.closed.set(Ok(()));
        let _ = self.released.wait().await;
    }

    pub async fn await_closed(&self) -> Result<(), TransportError> {
        self.closed.wait().await
    }
}

/// Server-side startup: bind, deploy, accept two connections, identify them,
/// assemble the transport. One attempt; any failure kills the kernel.
pub async fn serve(
    config: &TransportConfig,
    deploy: &dyn Deploy,
    progress: &dyn ProgressSink,
) -> Result<TransportServer, TransportError> {
    let listener = TcpListener::bind(config.bind_address()).await?;
    let local_addr = listener.local_addr()?;
    info!(
        target = "tidepool::transport::socket",
        address = %local_addr,
        "listening for kernel connections"
    );

    let process = deploy.deploy_kernel(local_addr).await?;
    progress.report(0.5, "kernel deployed");

    let channels = match establish_channels(&listener, config).await {
        Ok(channels) => channels,
        Err(err) => {
            warn!(
                target = "tidepool::transport::socket",
                pid = process.pid(),
                error = %err,
                "kernel transport startup failed; killing kernel"
            );
            if let Err(kill_err) = process.kill() {
                warn!(
                    target = "tidepool::transport::socket",
                    pid = process.pid(),
                    error = %kill_err,
                    "failed to kill kernel after startup failure"
                );
            }
            let _ = process.await_exit(config.shutdown_grace).await;
            return Err(err);
        }
    };
    progress.report(0.75, "kernel channels identified");
    info!(
        target = "tidepool::transport::socket",
        peer = %channels.peer_addr(),
        "kernel transport established"
    );

    Ok(TransportServer::new(
        listener, local_addr, process, channels, config,
    ))
}

/// Kernel-side startup: two connections to the server, a role tag first on
/// each.
pub async fn connect(
    addr: SocketAddr,
    config: &TransportConfig,
) -> Result<TransportClient, TransportError> {
    let main = FramedSocket::new(
        TcpStream::connect(addr).await?,
        Some(config.keepalive_interval),
    )?;
    main.write(&wire::encode_channel_role(ChannelRole::Main))
        .await?;
    let updates = FramedSocket::new(
        TcpStream::connect(addr).await?,
        Some(config.keepalive_interval),
    )?;
    updates
        .write(&wire::encode_channel_role(ChannelRole::NotebookUpdates))
        .await?;
    info!(
        target = "tidepool::transport::socket",
        server = %addr,
        "connected to notebook server"
    );
    Ok(TransportClient::new(ChannelPair::new(main, updates)))
}

async fn establish_channels(
    listener: &TcpListener,
    config: &TransportConfig,
) -> Result<ChannelPair, TransportError> {
    let first = accept_connection(listener, config).await?;
    let second = match accept_connection(listener, config).await {
        Ok(socket) => socket,
        Err(err) => {
            first.close().await;
            return Err(err);
        }
    };
    pair_channels(first, second, config.accept_timeout).await
}

async fn accept_connection(
    listener: &TcpListener,
    config: &TransportConfig,
) -> Result<Arc<FramedSocket>, TransportError> {
    match tokio::time::timeout(config.accept_timeout, listener.accept()).await {
        Ok(Ok((stream, addr))) => {
            debug!(
                target = "tidepool::transport::socket",
                peer = %addr,
                "accepted kernel connection"
            );
            Ok(FramedSocket::new(
                stream,
                Some(config.keepalive_interval),
            )?)
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(TransportError::Timeout("kernel connection")),
    }
}

/// Reads one role tag from each socket in parallel and binds sockets to
/// roles by the observed permutation. Anything but one tag per role is
/// fatal; both sockets are closed before the error surfaces.
async fn pair_channels(
    first: Arc<FramedSocket>,
    second: Arc<FramedSocket>,
    limit: Duration,
) -> Result<ChannelPair, TransportError> {
    let identified = tokio::try_join!(
        identify_channel(&first, limit),
        identify_channel(&second, limit)
    );
    match identified {
        Ok((ChannelRole::Main, ChannelRole::NotebookUpdates)) => {
            Ok(ChannelPair::new(first, second))
        }
        Ok((ChannelRole::NotebookUpdates, ChannelRole::Main)) => {
            Ok(ChannelPair::new(second, first))
        }
        Ok((role_a, role_b)) => {
            first.close().await;
            second.close().await;
            Err(TransportError::Handshake(format!(
                "expected one socket per role, got {role_a:?} and {role_b:?}"
            )))
        }
        Err(err) => {
            first.close().await;
            second.close().await;
            Err(err)
        }
    }
}

async fn identify_channel(
    socket: &Arc<FramedSocket>,
    limit: Duration,
) -> Result<ChannelRole, TransportError> {
    let tag = tokio::time::timeout(limit, async {
        loop {
            match socket.read_frame().await? {
                Some(Frame::Keepalive) => continue,
                Some(Frame::Payload(payload)) => {
                    return wire::decode_channel_role(&payload).map_err(|err| {
                        TransportError::Handshake(format!("invalid channel tag: {err}"))
                    });
                }
                None => {
                    return Err(TransportError::Handshake(
                        "connection closed before channel tag".to_string(),
                    ));
                }
            }
        }
    })
    .await;
    match tag {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout("channel identification")),
    }
}
