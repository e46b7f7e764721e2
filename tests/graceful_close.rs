//! End-to-end scenario 2: an application-driven `CLOSING` request (via `SocketHandle::close`)
//! propagates to the peer as a normal TCP close, without waiting for `TimeWaitValue` to elapse -
//! that cooldown only gates *reuse* of the handle, not how quickly the peer observes the close
//! (see `reuse_queue`'s unit tests for the cooldown logic itself, exercised with fabricated
//! timestamps so the test suite doesn't need to block for real wall-clock minutes).

mod common;

use common::{init_tracing, wait_until, EchoHandler, ForwardingHandler};
use std::net::Ipv4Addr;
use std::time::Duration;
use tcpcq::Manager;

#[test]
fn quit_closes_the_connection_from_the_server_side() {
    init_tracing();

    let (server_handler, _server_rx) = EchoHandler::new();
    let server = Manager::new_server(Box::new(server_handler)).expect("server manager construction");
    let _listener_id = server.listen(55557, true).expect("listen");

    let (client_handler, _client_rx) = ForwardingHandler::new();
    let client = Manager::new_client(Box::new(client_handler)).expect("client manager construction");
    let conn_id = client
        .connect(Ipv4Addr::LOCALHOST, 55557)
        .expect("connect should start and return an id");

    assert!(wait_until(|| client.is_client_socket_ready(conn_id), Duration::from_secs(5)));

    assert!(client.send(conn_id, b"quit\n"));

    // The server's `EchoHandler` calls `SocketHandle::close()` on receipt of "quit\n", which
    // requests `CLOSING`. Once the server side tears down, the client observes a zero-byte read
    // (peer half-close) and its own socket leaves `CONNECTED`, after which `SendData` on it
    // fails.
    assert!(
        wait_until(|| !client.send(conn_id, b"ping\n"), Duration::from_secs(5)),
        "client socket should stop accepting sends once the server closes the connection"
    );
}
