//! Listener and dispatch fabric.
//!
//! One task accepts sockets, a bounded set of gate tasks reads the
//! cleartext preamble, and every socket that passes is handed to the
//! worker with the fewest live connections. Everything before the TLS
//! handshake happens here; everything after happens inside a worker.

use crate::{
    config::Config,
    consts,
    error::Error,
    stats::StatsRegistry,
    tls,
    uds::{HttpUdsApi, UdsApi},
    worker::{self, Handoff, WorkerHandle},
};
use log::{debug, error, info, warn};
use std::{ffi::CString, net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Semaphore},
    time::timeout,
};

/// A bound broker, ready to serve.
pub struct Broker {
    cfg: Arc<Config>,
    api: Arc<dyn UdsApi>,
    registry: Arc<StatsRegistry>,
    listener: TcpListener,
}

impl Broker {
    /// Bind the listener and validate the TLS material. Everything fatal
    /// happens here, before a single worker exists.
    pub async fn bind(cfg: Config, force_ipv6: bool) -> Result<Broker, Error> {
        let api = Arc::new(HttpUdsApi::from_config(&cfg)?);
        Broker::bind_with_api(cfg, force_ipv6, api).await
    }

    /// Same as [`bind`](Self::bind) with a caller-supplied authorization
    /// implementation.
    pub async fn bind_with_api(
        cfg: Config,
        force_ipv6: bool,
        api: Arc<dyn UdsApi>,
    ) -> Result<Broker, Error> {
        if cfg.uds_server.is_empty() || cfg.uds_token.is_empty() {
            return Err(Error::Config(
                "uds_server and uds_token are required".into(),
            ));
        }
        // surface unreadable certificate material now, not in every worker
        drop(tls::build_acceptor(&cfg)?);

        let addr = cfg.listen_addr(force_ipv6)?;
        let listener = TcpListener::bind(addr).await?;
        let registry = StatsRegistry::new(cfg.workers);
        info!("Starting tunnel server on {}", addr);

        Ok(Broker {
            cfg: Arc::new(cfg),
            api,
            registry,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<StatsRegistry> {
        self.registry.clone()
    }

    /// Serve until the stop flag is raised, then wind down the workers.
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<(), Error> {
        let Broker {
            cfg,
            api,
            registry,
            listener,
        } = self;

        if let Some(user) = &cfg.user {
            drop_privileges(user)?;
        }
        if let Some(pidfile) = &cfg.pidfile {
            std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
        }

        let mut threads = Vec::with_capacity(cfg.workers);
        let mut senders = Vec::with_capacity(cfg.workers);
        for idx in 0..cfg.workers {
            let WorkerHandle { sender, thread } = worker::spawn(
                idx,
                cfg.clone(),
                api.clone(),
                registry.clone(),
                stop.clone(),
            )?;
            senders.push(sender);
            threads.push(thread);
        }
        let senders = Arc::new(senders);

        let gate_slots = Arc::new(Semaphore::new(consts::MAX_PREAMBLE_TASKS));
        let mut stop_rx = stop.clone();

        loop {
            tokio::select! {
                _ = worker::wait_for_stop(&mut stop_rx) => break,
                accepted = listener.accept() => match accepted {
                    Ok((sock, peer)) => {
                        if let Err(err) = sock.set_nodelay(true) {
                            debug!("cannot set TCP_NODELAY for {}: {}", peer, err);
                        }
                        tokio::spawn(gate_preamble(
                            sock,
                            peer,
                            senders.clone(),
                            registry.clone(),
                            gate_slots.clone(),
                        ));
                    }
                    Err(err) => error!("LOOP: {}", err),
                },
            }
        }

        drop(listener);
        drop(senders);
        for thread in threads {
            if thread.join().is_err() {
                error!("a worker thread panicked during shutdown");
            }
        }

        if let Some(pidfile) = &cfg.pidfile {
            if let Err(err) = std::fs::remove_file(pidfile) {
                warn!("Could not remove pidfile {:?}: {}", pidfile, err);
            }
        }
        info!("FINISHED");
        Ok(())
    }
}

/// Read exactly the preamble and pass the socket on.
///
/// The semaphore keeps stalling clients from tying up more than a fixed
/// number of gate tasks; the timeout kicks each of them out eventually.
/// Whatever fails here is logged and closed without a reply.
async fn gate_preamble(
    mut sock: TcpStream,
    peer: SocketAddr,
    workers: Arc<Vec<mpsc::Sender<Handoff>>>,
    registry: Arc<StatsRegistry>,
    slots: Arc<Semaphore>,
) {
    let _slot = match slots.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let mut preamble = [0u8; consts::HANDSHAKE_V1.len()];
    let read = timeout(consts::HANDSHAKE_TIMEOUT, sock.read_exact(&mut preamble)).await;
    match read {
        Ok(Ok(_)) if preamble[..] == *consts::HANDSHAKE_V1 => {}
        Ok(Ok(_)) => {
            warn!("{}", Error::handshake_invalid(&peer, &preamble));
            return;
        }
        Ok(Err(err)) => {
            warn!("HANDSHAKE failed from {}: {}", peer, err);
            return;
        }
        Err(_) => {
            warn!("HANDSHAKE timed out from {}", peer);
            return;
        }
    }
    debug!("HANDSHAKE from {}", peer);

    let idx = registry.least_loaded();
    registry.worker_started(idx);
    let sock = match sock.into_std() {
        Ok(sock) => sock,
        Err(err) => {
            error!("cannot detach socket for {}: {}", peer, err);
            registry.worker_finished(idx);
            return;
        }
    };
    if workers[idx].send((sock, peer)).await.is_err() {
        registry.worker_finished(idx);
        error!("worker {} is gone, dropping connection from {}", idx, peer);
    }
}

/// Give up root after the bind, the way the init scripts expect.
fn drop_privileges(user: &str) -> Result<(), Error> {
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }
    debug!("Changing to user {}", user);
    let name =
        CString::new(user).map_err(|_| Error::Config(format!("bad user name {:?}", user)))?;
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            return Err(Error::Config(format!("unknown user {:?}", user)));
        }
        if libc::setgid((*pw).pw_gid) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::setuid((*pw).pw_uid) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
