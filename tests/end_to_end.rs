//! Drives a real server over TCP with CSV files in a temporary directory.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sheetcache::cache::{CacheConfig, ResultCache};
use sheetcache::convert::{ConvertError, Converter, CsvConverter, LocalFileSystem};
use sheetcache::dispatch::Dispatcher;
use sheetcache::http::Request;
use sheetcache::server::{Server, ServerError};

/// Wraps the real converter, counting calls and slowing each one down so
/// concurrent requests overlap.
struct CountingConverter {
    inner: CsvConverter,
    calls: AtomicUsize,
    delay: Duration,
}

impl Converter for CountingConverter {
    fn convert(&self, source: &Path) -> Result<Bytes, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.convert(source)
    }
}

struct Harness {
    addr: SocketAddr,
    converter: Arc<CountingConverter>,
    stop: Option<oneshot::Sender<()>>,
    running: JoinHandle<Result<(), ServerError>>,
    _root: tempfile::TempDir,
}

impl Harness {
    async fn start(cache: CacheConfig, delay: Duration) -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("sales.csv"), "item,qty\nwidget,3\n").unwrap();
        std::fs::create_dir(root.path().join("q3")).unwrap();
        std::fs::write(root.path().join("q3/costs.csv"), "a,1\nb,2\n").unwrap();

        let fs = Arc::new(LocalFileSystem);
        let converter = Arc::new(CountingConverter {
            inner: CsvConverter::new(fs.clone()),
            calls: AtomicUsize::new(0),
            delay,
        });
        let dispatcher = Arc::new(Dispatcher::new(
            root.path(),
            Arc::new(ResultCache::new(cache)),
            fs,
            converter.clone(),
        ));

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(
            move |req: Request| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.serve(req).await }
            },
            async {
                let _ = stopped.await;
            },
        ));

        Self {
            addr,
            converter,
            stop: Some(stop),
            running,
            _root: root,
        }
    }

    fn conversions(&self) -> usize {
        self.converter.calls.load(Ordering::SeqCst)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(10), self.running)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn long_lived() -> CacheConfig {
    CacheConfig {
        capacity: 16,
        ttl: Duration::from_secs(600),
        ..CacheConfig::default()
    }
}

struct Reply {
    status: u16,
    head: String,
    body: Vec<u8>,
}

async fn send(addr: SocketAddr, method: &str, path: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has no header terminator");
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    let status = head
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("response has no status code");

    Reply {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    }
}

async fn get(addr: SocketAddr, path: &str) -> Reply {
    send(addr, "GET", path).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn converts_once_and_serves_repeats_from_cache() {
    let harness = Harness::start(long_lived(), Duration::ZERO).await;

    let first = get(harness.addr, "/sales.csv").await;
    assert_eq!(first.status, 200);
    assert!(first.head.contains("Content-Type: application/vnd.ms-excel\r\n"));
    assert!(String::from_utf8_lossy(&first.body).contains("<Worksheet ss:Name=\"sales\">"));
    assert_eq!(harness.conversions(), 1);

    let second = get(harness.addr, "/sales.csv").await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body, first.body);
    assert_eq!(harness.conversions(), 1);

    let nested = get(harness.addr, "/q3/costs.csv").await;
    assert_eq!(nested.status, 200);
    assert_eq!(harness.conversions(), 2);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_file_is_404_without_conversion() {
    let harness = Harness::start(long_lived(), Duration::ZERO).await;

    let reply = get(harness.addr, "/nope.csv").await;
    assert_eq!(reply.status, 404);
    assert!(reply.head.contains("Content-Type: text/plain\r\n"));
    assert_eq!(reply.body, b"Error: File not found!");

    let escape = get(harness.addr, "/../etc/passwd").await;
    assert_eq!(escape.status, 404);
    assert_eq!(harness.conversions(), 0);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_get_is_405() {
    let harness = Harness::start(long_lived(), Duration::ZERO).await;

    for method in ["POST", "PUT", "DELETE"] {
        let reply = send(harness.addr, method, "/sales.csv").await;
        assert_eq!(reply.status, 405);
        assert_eq!(reply.body, b"Method not allowed!");
    }
    assert_eq!(harness.conversions(), 0);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_requests_share_one_conversion() {
    let harness = Harness::start(long_lived(), Duration::from_millis(200)).await;

    let requests: Vec<_> = (0..50)
        .map(|_| {
            let addr = harness.addr;
            tokio::spawn(async move { get(addr, "/sales.csv").await })
        })
        .collect();

    let mut bodies = Vec::with_capacity(requests.len());
    for request in requests {
        let reply = request.await.unwrap();
        assert_eq!(reply.status, 200);
        bodies.push(reply.body);
    }

    assert_eq!(harness.conversions(), 1);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_entries_are_converted_again() {
    let cache = CacheConfig {
        capacity: 16,
        ttl: Duration::from_millis(150),
        ..CacheConfig::default()
    };
    let harness = Harness::start(cache, Duration::ZERO).await;

    assert_eq!(get(harness.addr, "/sales.csv").await.status, 200);
    assert_eq!(get(harness.addr, "/sales.csv").await.status, 200);
    assert_eq!(harness.conversions(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(get(harness.addr, "/sales.csv").await.status, 200);
    assert_eq!(harness.conversions(), 2);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_connection_serves_several_requests() {
    let harness = Harness::start(long_lived(), Duration::ZERO).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream
        .write_all(b"GET /sales.csv HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    stream
        .write_all(b"GET /sales.csv HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert!(text.contains("Connection: keep-alive\r\n"));
    assert_eq!(harness.conversions(), 1);

    harness.shutdown().await;
}
