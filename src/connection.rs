//! Per-connection protocol state machine.
//!
//! A connection arrives here already TLS-upgraded. It starts in
//! [`Phase::AwaitCommand`] with a deadline for the complete command,
//! moves to [`Phase::Proxying`] only after a successful `OPEN`, and every
//! path funnels into the idempotent close handling in [`Phase::Closing`].

use crate::{
    config::Config,
    consts,
    error::Error,
    stats::{ConnStats, StatsRegistry},
    uds::{Termination, UdsApi},
};
use log::{debug, error, info, warn};
use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{lookup_host, TcpStream},
    sync::{mpsc, watch},
    time::{timeout_at, Instant},
};

/// Connection phases. `Proxying` is only ever entered with a live backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    AwaitCommand,
    Proxying,
    Closing,
}

/// Hex of the microsecond wall clock; unique enough to correlate log lines.
pub fn next_tunnel_id() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    format!("{:X}", micros)
}

pub struct Connection<S> {
    tunnel_id: String,
    stream: S,
    peer: SocketAddr,
    tls_version: String,
    tls_cipher: String,
    phase: Phase,
    destination: Option<(String, u16)>,
    notify_ticket: Option<String>,
    backend: Option<TcpStream>,
    stats: ConnStats,
    cfg: Arc<Config>,
    api: Arc<dyn UdsApi>,
    notify_queue: mpsc::Sender<Termination>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        peer: SocketAddr,
        tls_version: String,
        tls_cipher: String,
        cfg: Arc<Config>,
        api: Arc<dyn UdsApi>,
        registry: Arc<StatsRegistry>,
        notify_queue: mpsc::Sender<Termination>,
    ) -> Self {
        Connection {
            tunnel_id: next_tunnel_id(),
            stream,
            peer,
            tls_version,
            tls_cipher,
            phase: Phase::AwaitCommand,
            destination: None,
            notify_ticket: None,
            backend: None,
            stats: ConnStats::new(registry),
            cfg,
            api,
            notify_queue,
        }
    }

    /// Drive the connection until it closes. Never propagates an error;
    /// everything is handled at this boundary.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(
            "CONNECT ({}) FROM {} ({}/{})",
            self.tunnel_id, self.peer, self.tls_version, self.tls_cipher
        );

        loop {
            self.phase = match self.phase {
                Phase::AwaitCommand => {
                    let deadline = Instant::now() + self.cfg.command_timeout;
                    match self.await_command(deadline).await {
                        Ok(next) => next,
                        Err(Error::CommandTimeout) => {
                            error!("TIMEOUT ({}) FROM {}", self.tunnel_id, self.peer);
                            let _ = self.stream.write_all(consts::RESPONSE_ERROR_TIMEOUT).await;
                            Phase::Closing
                        }
                        Err(Error::PeerDisconnect) => {
                            debug!(
                                "DISCONNECT ({}) from {} before completing a command",
                                self.tunnel_id, self.peer
                            );
                            Phase::Closing
                        }
                        Err(err) => {
                            error!("ERROR ({}) from {}: {}", self.tunnel_id, self.peer, err);
                            Phase::Closing
                        }
                    }
                }
                Phase::Proxying => {
                    self.proxy(&mut stop).await;
                    Phase::Closing
                }
                Phase::Closing => break,
            };
        }

        self.close().await;
    }

    /// Read and dispatch one command. The deadline covers the tag and its
    /// tail; the authorization exchange and backend dial run outside it.
    async fn await_command(&mut self, deadline: Instant) -> Result<Phase, Error> {
        let mut tag = [0u8; consts::COMMAND_LENGTH];
        self.read_exact_by(&mut tag, deadline).await?;

        match &tag {
            b"TEST" => {
                info!("COMMAND ({}): TEST", self.tunnel_id);
                self.stream.write_all(consts::RESPONSE_OK).await?;
                Ok(Phase::Closing)
            }
            b"STAT" => self.handle_stats(true, deadline).await,
            b"INFO" => self.handle_stats(false, deadline).await,
            b"OPEN" => self.handle_open(deadline).await,
            _ => {
                let err = Error::CommandInvalid {
                    tag: String::from_utf8_lossy(&tag).into_owned(),
                };
                error!("ERROR ({}) from {}: {}", self.tunnel_id, self.peer, err);
                self.stream.write_all(consts::RESPONSE_ERROR_COMMAND).await?;
                Ok(Phase::Closing)
            }
        }
    }

    async fn handle_stats(&mut self, detailed: bool, deadline: Instant) -> Result<Phase, Error> {
        let mut password = [0u8; consts::PASSWORD_LENGTH];
        self.read_exact_by(&mut password, deadline).await?;
        info!(
            "COMMAND ({}): {}",
            self.tunnel_id,
            if detailed { "STAT" } else { "INFO" }
        );

        let source = self.peer.ip().to_string();
        let allowed = self.cfg.allow.iter().any(|ip| *ip == source)
            && password[..] == *self.cfg.secret.as_bytes();
        if !allowed {
            warn!(
                "ERROR ({}) from {}: {}",
                self.tunnel_id,
                self.peer,
                Error::Forbidden {
                    peer: self.peer.to_string()
                }
            );
            self.stream.write_all(consts::RESPONSE_FORBIDDEN).await?;
            return Ok(Phase::Closing);
        }

        let lines = if detailed {
            self.stats.registry().detailed_snapshot()
        } else {
            vec![self.stats.registry().snapshot()]
        };
        for line in lines {
            debug!("SENDING ({}) {}", self.tunnel_id, line);
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\n").await?;
        }
        Ok(Phase::Closing)
    }

    async fn handle_open(&mut self, deadline: Instant) -> Result<Phase, Error> {
        let mut ticket = [0u8; consts::TICKET_LENGTH];
        self.read_exact_by(&mut ticket, deadline).await?;

        if !consts::ticket_is_valid(&ticket) {
            let err = Error::ticket_invalid(&ticket);
            error!("ERROR ({}) from {}: {}", self.tunnel_id, self.peer, err);
            self.stream.write_all(consts::RESPONSE_ERROR_TICKET).await?;
            return Ok(Phase::Closing);
        }
        let ticket = String::from_utf8_lossy(&ticket).into_owned();

        // No reads from the client from here until the backend is ready.
        let source_ip = self.peer.ip().to_string();
        let resolved = match self.api.resolve(&ticket, &source_ip).await {
            Ok(resolved) => resolved,
            Err(err) => {
                error!("ERROR ({}) from {}: {}", self.tunnel_id, self.peer, err);
                self.stream.write_all(consts::RESPONSE_ERROR_TICKET).await?;
                return Ok(Phase::Closing);
            }
        };

        self.destination = Some((resolved.host.clone(), resolved.port));
        info!(
            "OPEN TUNNEL ({}) FROM {} to {}",
            self.tunnel_id,
            self.peer,
            self.pretty_destination()
        );

        let backend = match dial_backend(&resolved.host, resolved.port, self.cfg.ipv6).await {
            Ok(backend) => backend,
            Err(err) => {
                error!("CONNECTION FAILED ({}): {}", self.tunnel_id, err);
                self.stream.write_all(consts::RESPONSE_ERROR_CONNECT).await?;
                return Ok(Phase::Closing);
            }
        };

        // The session becomes reportable only once the dial succeeded.
        if !resolved.notify.is_empty() {
            self.notify_ticket = Some(resolved.notify);
        }
        self.backend = Some(backend);
        self.stream.write_all(consts::RESPONSE_OK).await?;
        self.stats.increment_connections();
        Ok(Phase::Proxying)
    }

    /// Splice bytes both ways until one side finishes or the broker stops.
    async fn proxy(&mut self, stop: &mut watch::Receiver<bool>) {
        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => {
                debug_assert!(false, "Proxying without a backend");
                return;
            }
        };

        let (backend_read, backend_write) = tokio::io::split(backend);
        let (client_read, client_write) = tokio::io::split(&mut self.stream);
        let stats = &self.stats;

        tokio::select! {
            result = copy_client_to_backend(client_read, backend_write, stats) => {
                log_relay_end(&self.tunnel_id, "client", result);
            }
            result = copy_backend_to_client(backend_read, client_write, stats) => {
                log_relay_end(&self.tunnel_id, "backend", result);
            }
            _ = crate::worker::wait_for_stop(stop) => {
                debug!("STOP ({}) relay interrupted", self.tunnel_id);
            }
        }
    }

    /// Idempotent teardown: flush and release counters, close transports,
    /// and queue the one termination report when there is one to make.
    async fn close(&mut self) {
        self.phase = Phase::Closing;
        self.stats.close();
        let _ = self.stream.shutdown().await;
        drop(self.backend.take());

        match self.notify_ticket.take() {
            Some(notify) => {
                info!(
                    "TERMINATED ({}) {} to {}, s:{}, r:{}, t:{}",
                    self.tunnel_id,
                    self.peer,
                    self.pretty_destination(),
                    self.stats.local_sent(),
                    self.stats.local_recv(),
                    self.stats.elapsed().as_secs()
                );
                let termination = Termination {
                    notify,
                    sent: self.stats.local_sent(),
                    recv: self.stats.local_recv(),
                    tunnel_id: self.tunnel_id.clone(),
                };
                // Bounded queue; the close path must not suspend on HTTP.
                if let Err(err) = self.notify_queue.try_send(termination) {
                    error!(
                        "ERROR ({}) {}",
                        self.tunnel_id,
                        Error::NotifyFailure(err.to_string())
                    );
                }
            }
            None => info!("TERMINATED ({}) {}", self.tunnel_id, self.peer),
        }
    }

    async fn read_exact_by(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), Error> {
        match timeout_at(deadline, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::PeerDisconnect)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(Error::CommandTimeout),
        }
    }

    fn pretty_destination(&self) -> String {
        match &self.destination {
            Some((host, port)) if host.contains(':') => format!("[{}]:{}", host, port),
            Some((host, port)) => format!("{}:{}", host, port),
            None => "-".to_string(),
        }
    }
}

/// IPv6 is used for hosts that are v6 literals, or on request for hosts
/// that are not v4 literals.
pub fn prefers_ipv6(host: &str, config_ipv6: bool) -> bool {
    host.contains(':') || (config_ipv6 && !host.contains('.'))
}

async fn dial_backend(host: &str, port: u16, config_ipv6: bool) -> Result<TcpStream, Error> {
    let destination = format!("{}:{}", host, port);
    let backend_err = |cause| Error::BackendUnreachable {
        destination: destination.clone(),
        cause,
    };

    let want_v6 = prefers_ipv6(host, config_ipv6);
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(&backend_err)?
        .collect();
    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv6() == want_v6)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            backend_err(io::Error::new(
                io::ErrorKind::NotFound,
                "name resolved to no addresses",
            ))
        })?;

    TcpStream::connect(addr).await.map_err(&backend_err)
}

async fn copy_client_to_backend<R, W>(
    mut client: R,
    mut backend: W,
    stats: &ConnStats,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; consts::BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        backend.write_all(&buf[..n]).await?;
        stats.add_sent(n as u64);
        total += n as u64;
    }
    // Pass the shutdown on, the backend must see the EOF.
    backend.shutdown().await?;
    Ok(total)
}

async fn copy_backend_to_client<R, W>(
    mut backend: R,
    mut client: W,
    stats: &ConnStats,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; consts::BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = backend.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client.write_all(&buf[..n]).await?;
        stats.add_recv(n as u64);
        total += n as u64;
    }
    client.shutdown().await?;
    Ok(total)
}

fn log_relay_end(tunnel_id: &str, side: &str, result: io::Result<u64>) {
    match result {
        Ok(total) => debug!("RELAY ({}) {} side done after {} bytes", tunnel_id, side, total),
        Err(err)
            if err.kind() == io::ErrorKind::ConnectionReset
                || err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::UnexpectedEof =>
        {
            // resets are routine for a relay
            debug!("RELAY ({}) {} side disconnected: {}", tunnel_id, side, err);
        }
        Err(err) => error!("RELAY ({}) {} side failed: {}", tunnel_id, side, err),
    }
}
