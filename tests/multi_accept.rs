//! A listener accepting a stream of short-lived connections from one
//! reconnecting client.

use simnet::{DefaultConfig, Family, Host, Simulation, TcpAcceptor, TcpSocket};
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

fn accept_next(listener: TcpAcceptor, sock: TcpSocket, accepted: Rc<Cell<u32>>) {
    let next_listener = listener.clone();
    let next_sock = sock.clone();
    listener.async_accept(&sock, move |result| {
        if result.is_err() {
            return;
        }
        accepted.set(accepted.get() + 1);
        next_sock.close();
        accept_next(next_listener, next_sock, accepted);
    });
}

fn connect_next(sock: TcpSocket, target: SocketAddr, connected: Rc<Cell<u32>>) {
    let next_sock = sock.clone();
    sock.async_connect(target, move |result| {
        if result.is_err() {
            return;
        }
        connected.set(connected.get() + 1);
        next_sock.close();
        if connected.get() <= 5 {
            connect_next(next_sock, target, connected);
        }
    });
}

#[test]
fn six_connections_accepted() {
    let sim = Simulation::new(DefaultConfig::default());
    let server = Host::new(&sim, ["40.30.20.10".parse().unwrap()]);
    let client = Host::new(&sim, ["10.20.30.40".parse().unwrap()]);

    let listener = TcpAcceptor::new(&server);
    listener.open(Family::V4).unwrap();
    listener.bind("0.0.0.0:1337".parse().unwrap()).unwrap();
    listener.listen(10).unwrap();

    let accepted = Rc::new(Cell::new(0));
    let incoming = TcpSocket::new(&server);
    accept_next(listener.clone(), incoming, accepted.clone());

    let connected = Rc::new(Cell::new(0));
    let outgoing = TcpSocket::new(&client);
    connect_next(
        outgoing,
        "40.30.20.10:1337".parse().unwrap(),
        connected.clone(),
    );

    sim.run();

    assert_eq!(connected.get(), 6);
    assert_eq!(accepted.get(), 6);
}
