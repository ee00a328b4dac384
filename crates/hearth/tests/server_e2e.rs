use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use hearth::{AppContext, Server, ServerConfig, ServerHandle};
use tempfile::TempDir;

const BODY_HTML: &[u8] = b"<h1>hello</h1>";
const BODY_TXT: &[u8] = b"plain text payload";

struct TestServer {
    handle: ServerHandle,
    join: Option<thread::JoinHandle<()>>,
    _root: TempDir,
}

impl TestServer {
    fn start(idle_timeout: Duration) -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), BODY_HTML).unwrap();
        std::fs::write(root.path().join("data.txt"), BODY_TXT).unwrap();

        let ctx = Arc::new(AppContext::new(root.path().to_path_buf()).unwrap());
        let cfg = ServerConfig {
            port: 0,
            backlog: 50,
            threads: 2,
            idle_timeout,
            cleanup_period: Duration::from_millis(100),
        };
        let server = Server::bind(cfg, ctx).unwrap();
        let handle = server.handle();
        let join = thread::spawn(move || server.run().unwrap());
        Self { handle, join: Some(join), _root: root }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}

/// One full exchange on a fresh connection; the request must make the
/// server close when done (error status or `Connection: close`).
fn exchange(addr: SocketAddr, request: &str) -> String {
    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock.write_all(request.as_bytes()).unwrap();
    let mut out = Vec::new();
    sock.read_to_end(&mut out).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Reads one response (`\n`-terminated headers, then `Content-Length`
/// bytes) off a connection that stays open.
fn read_response(sock: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\n\n") {
        sock.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    sock.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn serves_a_file() {
    let server = TestServer::start(Duration::from_secs(5));
    let reply = exchange(
        server.addr(),
        "GET /index.html HTTP/1.1\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 200 OK\n"), "{reply}");
    assert!(reply.contains("Content-Length: 14\n"), "{reply}");
    assert!(reply.contains("Content-Type: text/html\n"), "{reply}");
    assert!(reply.ends_with("<h1>hello</h1>"), "{reply}");
}

#[test]
fn missing_file_is_404() {
    let server = TestServer::start(Duration::from_secs(5));
    let reply = exchange(
        server.addr(),
        "GET /nope.html HTTP/1.1\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\n"), "{reply}");
    assert!(reply.contains("Content-Length: 0\n"), "{reply}");
}

#[test]
fn malformed_request_is_400() {
    let server = TestServer::start(Duration::from_secs(5));

    let reply = exchange(server.addr(), "BREW /coffee HTTP/1.1\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\n"), "{reply}");

    let reply = exchange(server.addr(), "complete nonsense\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\n"), "{reply}");

    let reply = exchange(server.addr(), "GET /index.html HTTP/3.0\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\n"), "{reply}");
}

#[test]
fn oversize_request_line_is_414() {
    let server = TestServer::start(Duration::from_secs(5));
    let long = "x".repeat(2048);
    let reply = exchange(
        server.addr(),
        &format!("GET /{long} HTTP/1.1\r\n\r\n"),
    );
    assert!(reply.starts_with("HTTP/1.1 414 Request-URI Too Large\n"), "{reply}");
}

#[test]
fn dotdot_segments_are_rejected() {
    let server = TestServer::start(Duration::from_secs(5));
    let reply = exchange(
        server.addr(),
        "GET /../index.html HTTP/1.1\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\n"), "{reply}");
}

#[test]
fn head_suppresses_the_body() {
    let server = TestServer::start(Duration::from_secs(5));
    let reply = exchange(
        server.addr(),
        "HEAD /index.html HTTP/1.1\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 200 OK\n"), "{reply}");
    assert!(reply.contains("Content-Length: 14\n"), "{reply}");
    assert!(reply.ends_with("\n\n"), "{reply}");
}

#[test]
fn keep_alive_serves_multiple_requests() {
    let server = TestServer::start(Duration::from_secs(5));
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    sock.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut sock);
    assert!(head.starts_with("HTTP/1.1 200 OK\n"), "{head}");
    assert_eq!(body, BODY_HTML);

    sock.write_all(b"GET /data.txt HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut sock);
    assert!(head.contains("Content-Type: text/plain\n"), "{head}");
    assert_eq!(body, BODY_TXT);

    // the server closes once the second response is done
    let mut rest = Vec::new();
    sock.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn survives_a_burst_of_half_requests() {
    let server = TestServer::start(Duration::from_secs(5));
    let addr = server.addr();

    // 128 parallel clients each send a fragment and hang up
    let mut clients = Vec::new();
    for _ in 0..128 {
        clients.push(thread::spawn(move || {
            let mut sock = TcpStream::connect(addr).unwrap();
            sock.write_all(b"test").unwrap();
        }));
    }
    for c in clients {
        c.join().unwrap();
    }

    // the server is still healthy and serving
    let reply = exchange(addr, "GET /data.txt HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\n"), "{reply}");
    assert!(reply.ends_with("plain text payload"), "{reply}");
}

#[test]
fn idle_connections_are_swept() {
    let server = TestServer::start(Duration::from_millis(300));
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // say nothing; the timeout sweep should hang up on us
    let mut buf = [0u8; 16];
    let n = sock.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn graceful_shutdown_closes_live_connections() {
    let server = TestServer::start(Duration::from_secs(30));
    let mut sock = TcpStream::connect(server.addr()).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock.write_all(b"GET /ind").unwrap();
    thread::sleep(Duration::from_millis(100));

    server.handle.shutdown();
    // teardown closes the half-open connection
    let mut buf = [0u8; 16];
    let n = sock.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}
