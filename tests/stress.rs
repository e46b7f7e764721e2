//! Scaled-down versions of end-to-end scenarios 5 and 6: many concurrent connections driven by
//! repeated `SendDataToAll`, then a manager teardown while connections are still live. The
//! design's own scenario uses 1000 connections; this suite uses a count two orders of magnitude
//! smaller so it completes quickly while still exercising every code path (fan-out accept,
//! concurrent per-socket dispatch, orderly worker shutdown with sockets still open).

mod common;

use common::{init_tracing, wait_until, EchoHandler, ForwardingHandler};
use std::net::Ipv4Addr;
use std::time::Duration;
use tcpcq::Manager;

#[test]
fn many_connections_survive_broadcast_and_clean_shutdown() {
    init_tracing();

    const CONNECTIONS: usize = 25;
    const ROUNDS: usize = 4;

    let (server_handler, _server_rx) = EchoHandler::new();
    let server = Manager::new_server(Box::new(server_handler)).expect("server manager construction");
    let _listener_id = server.listen(55558, false).expect("listen");

    let (client_handler, client_rx) = ForwardingHandler::new();
    let client = Manager::new_client(Box::new(client_handler)).expect("client manager construction");

    let mut ids = Vec::with_capacity(CONNECTIONS);
    for _ in 0..CONNECTIONS {
        let id = client
            .connect(Ipv4Addr::LOCALHOST, 55558)
            .expect("connect should start and return an id");
        ids.push(id);
    }

    for id in &ids {
        assert!(
            wait_until(|| client.is_client_socket_ready(*id), Duration::from_secs(10)),
            "connection {id} did not reach CONNECTED in time"
        );
    }

    for _ in 0..ROUNDS {
        server.send_to_all(b"ping\n");
    }

    let expected = CONNECTIONS * ROUNDS;
    let mut observed = 0;
    while observed < expected {
        common::recv_within(&client_rx, Duration::from_secs(10))
            .unwrap_or_else(|| panic!("timed out waiting for pongs, saw {observed}/{expected}"));
        observed += 1;
    }

    // Shutdown-while-busy: every connection above is still CONNECTED. Dropping both managers
    // must join every worker thread and release every socket/buffer without panicking or
    // hanging - `Drop for Manager` posts one synthetic `End` completion per worker and joins
    // them before closing the remaining sockets.
    drop(client);
    drop(server);
}
