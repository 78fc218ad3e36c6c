//! Worker event loops.
//!
//! Each worker runs on its own OS thread with a dedicated single-threaded
//! runtime: connections within one worker never run in parallel, workers
//! among each other do. The dispatcher feeds a worker pre-checked sockets
//! through a private channel; channel closure means the dispatcher is gone
//! and the worker drains and exits.

use crate::{
    config::Config,
    connection::Connection,
    consts,
    error::Error,
    stats::StatsRegistry,
    tls,
    uds::{self, Termination, UdsApi},
};
use log::{debug, error, info, warn};
use openssl::ssl::SslAcceptor;
use std::{net::SocketAddr, sync::Arc, thread};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinSet,
    time::timeout,
};

/// A socket that passed the preamble gate, ready for its TLS upgrade.
pub type Handoff = (std::net::TcpStream, SocketAddr);

/// Dispatcher-side handle of one worker.
pub struct WorkerHandle {
    pub sender: mpsc::Sender<Handoff>,
    pub thread: thread::JoinHandle<()>,
}

/// Resolves once the stop flag is raised; a vanished sender counts as stop.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            break;
        }
    }
}

/// Start one worker thread owning its own event loop.
pub fn spawn(
    idx: usize,
    cfg: Arc<Config>,
    api: Arc<dyn UdsApi>,
    registry: Arc<StatsRegistry>,
    stop: watch::Receiver<bool>,
) -> Result<WorkerHandle, Error> {
    let (sender, receiver) = mpsc::channel(consts::HANDOFF_QUEUE);
    let thread = thread::Builder::new()
        .name(format!("worker-{}", idx))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("WORKER {} cannot build its event loop: {}", idx, err);
                    return;
                }
            };
            runtime.block_on(worker_loop(idx, cfg, api, registry, receiver, stop));
        })?;
    Ok(WorkerHandle { sender, thread })
}

async fn worker_loop(
    idx: usize,
    cfg: Arc<Config>,
    api: Arc<dyn UdsApi>,
    registry: Arc<StatsRegistry>,
    mut handoffs: mpsc::Receiver<Handoff>,
    mut stop: watch::Receiver<bool>,
) {
    // The same material was already validated before the workers spawned;
    // failing here means it changed on disk in between.
    let acceptor = match tls::build_acceptor(&cfg) {
        Ok(acceptor) => acceptor,
        Err(err) => {
            error!("WORKER {} cannot build a TLS context: {}", idx, err);
            return;
        }
    };

    let (notify_tx, notify_rx) = mpsc::channel(consts::NOTIFY_QUEUE);
    let notifier = tokio::spawn(uds::notifier(api.clone(), notify_rx));

    let mut tasks: JoinSet<()> = JoinSet::new();
    debug!("WORKER {} ready (pid {})", idx, std::process::id());

    loop {
        tokio::select! {
            handoff = handoffs.recv() => match handoff {
                Some((sock, peer)) => {
                    tasks.spawn(handle_connection(
                        sock,
                        peer,
                        acceptor.clone(),
                        cfg.clone(),
                        api.clone(),
                        registry.clone(),
                        notify_tx.clone(),
                        stop.clone(),
                    ));
                }
                None => {
                    debug!("WORKER {} handoff channel closed", idx);
                    break;
                }
            },
            Some(_) = tasks.join_next() => {
                registry.worker_finished(idx);
            }
            _ = wait_for_stop(&mut stop) => break,
        }
    }

    // sockets that were handed off but never started still count in the
    // live gauge; release them
    handoffs.close();
    while handoffs.try_recv().is_ok() {
        registry.worker_finished(idx);
    }

    // connections observe the stop flag and run their close paths
    while tasks.join_next().await.is_some() {
        registry.worker_finished(idx);
    }
    drop(notify_tx);
    let _ = notifier.await;
    info!("WORKER {} stopped", idx);
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    sock: std::net::TcpStream,
    peer: SocketAddr,
    acceptor: SslAcceptor,
    cfg: Arc<Config>,
    api: Arc<dyn UdsApi>,
    registry: Arc<StatsRegistry>,
    notify_tx: mpsc::Sender<Termination>,
    stop: watch::Receiver<bool>,
) {
    let stream = match TcpStream::from_std(sock) {
        Ok(stream) => stream,
        Err(err) => {
            error!("NEGOTIATION ERROR from {}: {}", peer, err);
            return;
        }
    };

    let stream = match timeout(cfg.command_timeout, tls::accept(&acceptor, stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("NEGOTIATION ERROR from {}: {}", peer, err);
            return;
        }
        Err(_) => {
            warn!("NEGOTIATION ERROR from {}: TLS handshake timed out", peer);
            return;
        }
    };

    let (tls_version, tls_cipher) = {
        let ssl = stream.ssl();
        (
            ssl.version_str().to_string(),
            ssl.current_cipher()
                .map(|cipher| cipher.name().to_string())
                .unwrap_or_else(|| "NONE".to_string()),
        )
    };

    Connection::new(
        stream,
        peer,
        tls_version,
        tls_cipher,
        cfg,
        api,
        registry,
        notify_tx,
    )
    .run(stop)
    .await;
}
