//! End-to-end scenario 1 from the design's testable-properties list: a server and a client
//! manager in the same process, a ping sent, a pong observed.

mod common;

use common::{init_tracing, wait_until, EchoHandler, ForwardingHandler};
use std::net::Ipv4Addr;
use std::time::Duration;
use tcpcq::Manager;

#[test]
fn ping_produces_pong() {
    init_tracing();

    let (server_handler, _server_rx) = EchoHandler::new();
    let server = Manager::new_server(Box::new(server_handler)).expect("server manager construction");
    let _listener_id = server.listen(55555, false).expect("listen");

    let (client_handler, client_rx) = ForwardingHandler::new();
    let client = Manager::new_client(Box::new(client_handler)).expect("client manager construction");
    let conn_id = client
        .connect(Ipv4Addr::LOCALHOST, 55555)
        .expect("connect should start and return an id");

    assert!(
        wait_until(|| client.is_client_socket_ready(conn_id), Duration::from_secs(5)),
        "connection did not reach CONNECTED in time"
    );

    assert!(client.send(conn_id, b"ping\n"), "SendData should be admitted");

    let pong = common::recv_within(&client_rx, Duration::from_secs(5)).expect("pong within timeout");
    assert_eq!(pong, b"pong");
}

#[test]
fn repeated_pings_produce_pongs_in_order() {
    init_tracing();

    let (server_handler, _server_rx) = EchoHandler::new();
    let server = Manager::new_server(Box::new(server_handler)).expect("server manager construction");
    let _listener_id = server.listen(55556, false).expect("listen");

    let (client_handler, client_rx) = ForwardingHandler::new();
    let client = Manager::new_client(Box::new(client_handler)).expect("client manager construction");
    let conn_id = client
        .connect(Ipv4Addr::LOCALHOST, 55556)
        .expect("connect should start and return an id");

    assert!(wait_until(|| client.is_client_socket_ready(conn_id), Duration::from_secs(5)));

    const N: usize = 20;
    for _ in 0..N {
        assert!(client.send(conn_id, b"ping\n"));
        let pong = common::recv_within(&client_rx, Duration::from_secs(5)).expect("pong");
        assert_eq!(pong, b"pong");
    }
}
