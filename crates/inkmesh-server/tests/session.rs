//! Room sessions talking through a live relay and rendezvous server.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{TIMEOUT, spawn_server};
use inkmesh_core::presence::Instant;
use inkmesh_core::transport::DualTransport;
use inkmesh_core::{Connectivity, MouseButton, PointerEvent, RoomId, RoomSession, SessionConfig};
use inkmesh_server::ServerConfig;
use kurbo::{Point, Size};

type Session = RoomSession<DualTransport>;

const VIEWPORT: Size = Size::new(200.0, 200.0);

fn config(addr: SocketAddr, relay: bool, direct: bool) -> SessionConfig {
    SessionConfig {
        relay_url: relay.then(|| format!("ws://{}/ws", addr)),
        rendezvous_url: direct.then(|| format!("ws://{}/signal", addr)),
        listen_addr: "127.0.0.1:0".into(),
        ..SessionConfig::default()
    }
}

fn draw(session: &mut Session, points: &[(f64, f64)]) {
    let (first, rest) = points.split_first().unwrap();
    session.handle_pointer(
        &PointerEvent::Down {
            pointer_id: 1,
            position: Point::new(first.0, first.1),
            button: MouseButton::Left,
        },
        VIEWPORT,
    );
    for p in rest {
        session.handle_pointer(
            &PointerEvent::Move {
                pointer_id: 1,
                position: Point::new(p.0, p.1),
            },
            VIEWPORT,
        );
    }
    let (x, y) = points[points.len() - 1];
    session.handle_pointer(
        &PointerEvent::Up {
            pointer_id: 1,
            position: Point::new(x, y),
        },
        VIEWPORT,
    );
}

fn strokes(session: &Session) -> Vec<(String, Vec<Point>)> {
    session
        .replica()
        .strokes()
        .map(|s| (s.id.clone(), s.points.clone()))
        .collect()
}

/// Poll every session until `done` holds.
async fn pump_until(sessions: &mut [&mut Session], done: impl Fn(&[&mut Session]) -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        for session in sessions.iter_mut() {
            session.poll(Instant::now());
        }
        if done(sessions) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "sessions did not settle in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peers_converge_over_both_paths() {
    let (addr, _) = spawn_server(ServerConfig::default()).await;
    let room = RoomId::new("both-paths").unwrap();
    let mut a = Session::connect(room.clone(), &config(addr, true, true), Instant::now()).unwrap();
    let mut b = Session::connect(room, &config(addr, true, true), Instant::now()).unwrap();

    pump_until(&mut [&mut a, &mut b], |s| {
        s.iter().all(|s| s.connectivity() == Connectivity::Online)
    })
    .await;

    draw(&mut a, &[(10.0, 10.0), (60.0, 80.0), (120.0, 40.0)]);
    draw(&mut b, &[(150.0, 150.0)]);
    pump_until(&mut [&mut a, &mut b], |s| {
        s[0].replica().stroke_count() == 2 && strokes(&s[0]) == strokes(&s[1])
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_direct_mesh_alone() {
    let (addr, state) = spawn_server(ServerConfig::default()).await;
    let room = RoomId::new("mesh-only").unwrap();
    let mut a = Session::connect(room.clone(), &config(addr, false, true), Instant::now()).unwrap();
    let mut b = Session::connect(room, &config(addr, false, true), Instant::now()).unwrap();

    draw(&mut a, &[(20.0, 20.0), (40.0, 40.0)]);
    pump_until(&mut [&mut a, &mut b], |s| {
        s[1].replica().stroke_count() == 1 && strokes(&s[0]) == strokes(&s[1])
    })
    .await;
    assert_eq!(state.relay.room_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_only_peer_joins_late_and_catches_up() {
    let (addr, _) = spawn_server(ServerConfig::default()).await;
    let room = RoomId::new("mixed").unwrap();
    let mut a = Session::connect(room.clone(), &config(addr, true, true), Instant::now()).unwrap();
    pump_until(&mut [&mut a], |s| s[0].connectivity() == Connectivity::Online).await;

    draw(&mut a, &[(10.0, 10.0), (90.0, 90.0)]);
    a.clear();
    draw(&mut a, &[(30.0, 170.0), (100.0, 120.0)]);
    a.poll(Instant::now());

    let mut c = Session::connect(room, &config(addr, true, false), Instant::now()).unwrap();
    pump_until(&mut [&mut a, &mut c], |s| {
        s[1].replica().epoch() == 1 && strokes(&s[0]) == strokes(&s[1])
    })
    .await;
    assert_eq!(c.replica().stroke_count(), 1);

    draw(&mut c, &[(5.0, 5.0)]);
    pump_until(&mut [&mut a, &mut c], |s| {
        s[0].replica().stroke_count() == 2 && strokes(&s[0]) == strokes(&s[1])
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_relay_leaves_mesh_working() {
    let (addr, state) = spawn_server(ServerConfig::default()).await;
    let room = RoomId::new("relay-down").unwrap();
    let config = SessionConfig {
        relay_url: Some("ws://127.0.0.1:9/ws".into()),
        ..config(addr, false, true)
    };
    let mut a = Session::connect(room.clone(), &config, Instant::now()).unwrap();
    let mut b = Session::connect(room, &config, Instant::now()).unwrap();

    draw(&mut a, &[(20.0, 30.0), (70.0, 90.0)]);
    draw(&mut b, &[(160.0, 10.0)]);
    pump_until(&mut [&mut a, &mut b], |s| {
        s[0].replica().stroke_count() == 2 && strokes(&s[0]) == strokes(&s[1])
    })
    .await;
    assert_eq!(a.connectivity(), Connectivity::Degraded);
    assert_eq!(b.connectivity(), Connectivity::Degraded);
    assert_eq!(state.relay.room_count(), 0);
}
