//! End-to-end scenarios against an in-process broker: real sockets, real
//! TLS, a stub authorization service, and (where needed) an echo backend.

use async_trait::async_trait;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use pretty_assertions::assert_eq;
use std::{
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tlstunnel::{
    consts,
    error::Error,
    stats::{query_server_stats, StatsRegistry},
    uds::{TicketResponse, UdsApi},
    Broker, Config,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::{sleep, timeout},
};
use tokio_openssl::SslStream;

const SECRET: &str = "01234567890123456789012345678901";
const ONE_MIB: u64 = 1024 * 1024;

fn certs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/certs")
}

fn test_config() -> Config {
    Config {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        ipv6: false,
        workers: 2,
        command_timeout: Duration::from_secs(2),
        user: None,
        pidfile: None,
        loglevel: "debug".to_string(),
        ssl_certificate: certs_dir().join("cert.pem"),
        ssl_certificate_key: Some(certs_dir().join("key.pem")),
        ssl_password: None,
        ssl_ciphers: None,
        ssl_dhparam: None,
        ssl_min_tls_version: "1.2".to_string(),
        uds_server: "http://127.0.0.1:9/never-used".to_string(),
        uds_token: "tok".to_string(),
        uds_timeout: Duration::from_secs(5),
        uds_verify_ssl: false,
        secret: SECRET.to_string(),
        allow: vec!["127.0.0.1".to_string()],
    }
}

#[derive(Default)]
struct StubUds {
    response: Mutex<Option<TicketResponse>>,
    resolves: AtomicUsize,
    notifies: Mutex<Vec<(String, u64, u64)>>,
}

impl StubUds {
    fn resolving(host: &str, port: u16, notify: &str) -> Self {
        let stub = StubUds::default();
        *stub.response.lock().unwrap() = Some(TicketResponse {
            host: host.to_string(),
            port,
            notify: notify.to_string(),
        });
        stub
    }
}

#[async_trait]
impl UdsApi for StubUds {
    async fn resolve(&self, _ticket: &str, _source_ip: &str) -> Result<TicketResponse, Error> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        match self.response.lock().unwrap().clone() {
            Some(response) => Ok(response),
            None => Err(Error::UdsRefused {
                status: 403,
                body: "denied".to_string(),
            }),
        }
    }

    async fn notify_end(&self, notify: &str, sent: u64, recv: u64) -> Result<(), Error> {
        self.notifies
            .lock()
            .unwrap()
            .push((notify.to_string(), sent, recv));
        Ok(())
    }
}

struct TestBroker {
    addr: SocketAddr,
    registry: Arc<StatsRegistry>,
    api: Arc<StubUds>,
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Result<(), Error>>,
}

impl TestBroker {
    async fn start(cfg: Config, api: StubUds) -> TestBroker {
        let api = Arc::new(api);
        let broker = Broker::bind_with_api(cfg, false, api.clone())
            .await
            .expect("broker must bind");
        let addr = broker.local_addr().unwrap();
        let registry = broker.registry();
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(broker.run(stop_rx));
        TestBroker {
            addr,
            registry,
            api,
            stop,
            handle,
        }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = timeout(Duration::from_secs(10), self.handle).await;
    }
}

/// Preamble + TLS upgrade, certificate checks off.
async fn connect_client(addr: SocketAddr) -> SslStream<TcpStream> {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(consts::HANDSHAKE_V1).await.unwrap();

    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();
    let mut config = connector.configure().unwrap();
    config.set_verify_hostname(false);
    let ssl = config.into_ssl("localhost").unwrap();

    let mut stream = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut stream).connect().await.unwrap();
    stream
}

async fn read_reply(stream: &mut SslStream<TcpStream>) -> Vec<u8> {
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    reply
}

/// Echo server for the happy path; handles one connection.
async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    port
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;
    let total_before = broker.registry.connections_total();

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_TEST).await.unwrap();
    assert_eq!(read_reply(&mut client).await, consts::RESPONSE_OK);

    assert_eq!(broker.registry.connections_total(), total_before);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn info_with_wrong_password_is_forbidden() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_INFO).await.unwrap();
    client
        .write_all(b"wrong-password-padded-to-32-byte")
        .await
        .unwrap();
    assert_eq!(read_reply(&mut client).await, consts::RESPONSE_FORBIDDEN);

    assert_eq!(broker.registry.accum_sent(), 0);
    assert_eq!(broker.registry.accum_recv(), 0);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn info_from_disallowed_source_is_forbidden() {
    let mut cfg = test_config();
    cfg.allow.clear();
    let broker = TestBroker::start(cfg, StubUds::default()).await;

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_INFO).await.unwrap();
    client.write_all(SECRET.as_bytes()).await.unwrap();
    assert_eq!(read_reply(&mut client).await, consts::RESPONSE_FORBIDDEN);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn info_returns_the_summary_line() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_INFO).await.unwrap();
    client.write_all(SECRET.as_bytes()).await.unwrap();
    let reply = String::from_utf8(read_reply(&mut client).await).unwrap();

    assert!(reply.ends_with('\n'));
    let lines: Vec<&str> = reply.lines().collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].split(';').count(), 4);
    assert_eq!(lines[0], "0;0;0;0");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stat_returns_summary_plus_worker_detail() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_STAT).await.unwrap();
    client.write_all(SECRET.as_bytes()).await.unwrap();
    let reply = String::from_utf8(read_reply(&mut client).await).unwrap();

    let lines: Vec<&str> = reply.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].split(';').count(), 4);
    assert!(lines[1].starts_with("worker 0: "));
    assert!(lines[2].starts_with("worker 1: "));
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_query_client_round_trips() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;

    let mut cfg = test_config();
    cfg.listen_port = broker.addr.port();
    let reply = query_server_stats(&cfg, false).await.unwrap();
    assert_eq!(reply, "0;0;0;0\n");
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_happy_path_with_one_mib_echo() {
    let echo_port = spawn_echo_backend().await;
    let broker = TestBroker::start(
        test_config(),
        StubUds::resolving("127.0.0.1", echo_port, "ABCD"),
    )
    .await;

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_OPEN).await.unwrap();
    client.write_all(&[b'a'; consts::TICKET_LENGTH]).await.unwrap();

    let mut ok = [0u8; 2];
    client.read_exact(&mut ok).await.unwrap();
    assert_eq!(&ok, consts::RESPONSE_OK);

    // Push one MiB through while draining the echo concurrently.
    let (mut read_half, mut write_half) = tokio::io::split(client);
    let writer = tokio::spawn(async move {
        let chunk = vec![0xA5u8; 64 * 1024];
        for _ in 0..16 {
            write_half.write_all(&chunk).await.unwrap();
        }
        write_half
    });

    let mut buf = vec![0u8; 64 * 1024];
    let mut received = 0u64;
    while received < ONE_MIB {
        let n = read_half.read(&mut buf).await.unwrap();
        assert!(n > 0, "echo stream ended early at {} bytes", received);
        assert!(buf[..n].iter().all(|&b| b == 0xA5));
        received += n as u64;
    }
    assert_eq!(received, ONE_MIB);

    let write_half = writer.await.unwrap();
    drop(write_half);
    drop(read_half);

    // Close-out report arrives through the notifier task.
    let mut notified = false;
    for _ in 0..50 {
        if broker
            .api
            .notifies
            .lock()
            .unwrap()
            .iter()
            .any(|(notify, sent, recv)| notify == "ABCD" && *sent == ONE_MIB && *recv == ONE_MIB)
        {
            notified = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(notified, "termination notify not observed");
    assert_eq!(broker.api.notifies.lock().unwrap().len(), 1);

    let mut settled = false;
    for _ in 0..50 {
        if broker.registry.connections_current() == 0 {
            settled = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(settled, "connections_current did not return to zero");
    assert_eq!(broker.registry.connections_total(), 1);
    assert_eq!(broker.registry.accum_sent(), ONE_MIB as i64);
    assert_eq!(broker.registry.accum_recv(), ONE_MIB as i64);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_with_bad_ticket_skips_authorization() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;

    let mut client = connect_client(broker.addr).await;
    let mut ticket = [b'a'; consts::TICKET_LENGTH];
    ticket[3] = b'!';
    client.write_all(consts::COMMAND_OPEN).await.unwrap();
    client.write_all(&ticket).await.unwrap();
    assert_eq!(read_reply(&mut client).await, consts::RESPONSE_ERROR_TICKET);

    assert_eq!(broker.api.resolves.load(Ordering::SeqCst), 0);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_with_dead_backend_reports_connect_error() {
    // a port that refuses connections
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let broker = TestBroker::start(
        test_config(),
        StubUds::resolving("127.0.0.1", dead_port, "ABCD"),
    )
    .await;

    let mut client = connect_client(broker.addr).await;
    client.write_all(consts::COMMAND_OPEN).await.unwrap();
    client.write_all(&[b'a'; consts::TICKET_LENGTH]).await.unwrap();
    assert_eq!(read_reply(&mut client).await, consts::RESPONSE_ERROR_CONNECT);

    // never dialed successfully, so there is nothing to report
    sleep(Duration::from_millis(300)).await;
    assert!(broker.api.notifies.lock().unwrap().is_empty());
    assert_eq!(broker.registry.connections_total(), 0);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_gets_a_timeout() {
    let mut cfg = test_config();
    cfg.command_timeout = Duration::from_millis(400);
    let broker = TestBroker::start(cfg, StubUds::default()).await;

    let mut client = connect_client(broker.addr).await;
    // no command at all
    assert_eq!(read_reply(&mut client).await, consts::RESPONSE_ERROR_TIMEOUT);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_preamble_closes_without_a_reply() {
    let broker = TestBroker::start(test_config(), StubUds::default()).await;

    let mut tcp = TcpStream::connect(broker.addr).await.unwrap();
    tcp.write_all(b"GARBAGE").await.unwrap();

    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(5), tcp.read_to_end(&mut buf))
        .await
        .expect("socket must be closed")
        .unwrap();
    assert_eq!(n, 0, "no bytes may be written back");
    broker.shutdown().await;
}
