//! Loopback tests against real sockets

use portfwd_proto::{SocketEndpoint, SocketFd};
use portfwd_socket::{PipeSocketHandler, SocketHandler, TcpSocketHandler};
use std::io;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
    let started = Instant::now();
    loop {
        if let Some(value) = poll() {
            return value;
        }
        assert!(started.elapsed() < WAIT, "timed out waiting for socket");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn read_some(handler: &dyn SocketHandler, fd: SocketFd) -> Vec<u8> {
    wait_for(|| handler.has_data(fd).then_some(()));
    let mut buf = [0u8; 64];
    let n = handler.read(fd, &mut buf).unwrap();
    buf[..n].to_vec()
}

#[test]
fn test_tcp_accept_read_write_close() {
    let handler = TcpSocketHandler::new();
    let endpoint = SocketEndpoint::tcp("127.0.0.1", 0);
    let fds = handler.listen(&endpoint).unwrap();
    assert_eq!(fds.len(), 1);
    let listen_fd = *fds.iter().next().unwrap();
    let port = handler.local_addr(listen_fd).unwrap().port();

    assert!(handler.accept(listen_fd).unwrap().is_none());

    let client = handler
        .connect(&SocketEndpoint::tcp("127.0.0.1", port))
        .unwrap();
    let server = wait_for(|| handler.accept(listen_fd).unwrap());

    assert!(!handler.has_data(server));
    let mut buf = [0u8; 8];
    assert_eq!(
        handler.read(server, &mut buf).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );

    handler
        .write_all_or_return(client, b"ping", WAIT)
        .unwrap();
    assert_eq!(read_some(&handler, server), b"ping");

    let mut active = handler.active_sockets();
    active.sort_unstable();
    let mut expected = vec![client, server];
    expected.sort_unstable();
    assert_eq!(active, expected);

    handler.close(client);
    assert!(read_some(&handler, server).is_empty());

    handler.close(server);
    handler.stop_listening(&endpoint);
    assert!(handler.get_endpoint_fds(&endpoint).is_empty());
    assert!(handler.active_sockets().is_empty());
}

#[test]
fn test_tcp_listen_is_idempotent() {
    let handler = TcpSocketHandler::new();
    let endpoint = SocketEndpoint::tcp("127.0.0.1", 0);

    let first = handler.listen(&endpoint).unwrap();
    let second = handler.listen(&endpoint).unwrap();

    assert_eq!(first, second);
    handler.stop_listening(&endpoint);
}

#[test]
fn test_tcp_connect_refused() {
    let handler = TcpSocketHandler::new();
    let endpoint = SocketEndpoint::tcp("127.0.0.1", 0);
    let fds = handler.listen(&endpoint).unwrap();
    let port = handler
        .local_addr(*fds.iter().next().unwrap())
        .unwrap()
        .port();
    handler.stop_listening(&endpoint);

    assert!(handler
        .connect(&SocketEndpoint::tcp("127.0.0.1", port))
        .is_err());
}

#[test]
fn test_pipe_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    let endpoint = SocketEndpoint::pipe(path.to_string_lossy());
    let handler = PipeSocketHandler::new();

    let listen_fd = *handler.listen(&endpoint).unwrap().iter().next().unwrap();
    let client = handler.connect(&endpoint).unwrap();
    let server = wait_for(|| handler.accept(listen_fd).unwrap());

    handler.write_all_or_return(server, b"pong", WAIT).unwrap();
    assert_eq!(read_some(&handler, client), b"pong");

    handler.close(server);
    assert!(read_some(&handler, client).is_empty());
    handler.close(client);

    handler.stop_listening(&endpoint);
    assert!(!path.exists());
}
