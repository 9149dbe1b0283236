use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use time::Duration as TokenTtl;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tripteller_presence_core::{
    ClientEvent, IdentityClaims, JoinObserver, LocationSample, Role, ServerEvent,
};
use tripteller_presence_server::{
    config::PresenceConfig,
    identity::ClaimsTokenVerifier,
    presence::{PresenceRegistry, RegistryConfig},
    server::{router, AppState},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(config: PresenceConfig) -> (SocketAddr, Arc<AppState>) {
    let registry = Arc::new(PresenceRegistry::new(RegistryConfig::from(&config)));
    let state = Arc::new(AppState::new(
        registry,
        Arc::new(ClaimsTokenVerifier),
        &config,
        None,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn permissive() -> PresenceConfig {
    PresenceConfig {
        min_sample_interval: Duration::ZERO,
        ..PresenceConfig::default()
    }
}

async fn open(addr: SocketAddr, token: Option<&str>) -> Socket {
    let url = match token {
        Some(token) => format!("ws://{addr}/ws?token={token}"),
        None => format!("ws://{addr}/ws"),
    };
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    assert!(matches!(next_event(&mut socket).await, ServerEvent::Connected(_)));
    socket
}

async fn send(socket: &mut Socket, event: ClientEvent) {
    let text = serde_json::to_string(&event).unwrap();
    socket.send(Message::Text(text)).await.unwrap();
}

async fn next_event(socket: &mut Socket) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn join(socket: &mut Socket) {
    send(socket, ClientEvent::JoinObserver(JoinObserver::default())).await;
    assert!(matches!(next_event(socket).await, ServerEvent::SubjectSnapshot(_)));
    assert!(matches!(next_event(socket).await, ServerEvent::ObserverJoined(_)));
}

fn sample(subject: &str, latitude: f64, longitude: f64) -> ClientEvent {
    ClientEvent::LocationSample(LocationSample {
        subject_id: subject.into(),
        latitude,
        longitude,
        accuracy: Some(5.0),
        display_name: None,
        captured_at: 1_700_000_000_000,
    })
}

async fn wait_for_observers(state: &AppState, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.registry().observer_count() != expected {
        assert!(Instant::now() < deadline, "observer count never reached {expected}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn observers_follow_a_subject_until_they_leave() {
    let (addr, state) = spawn_server(permissive()).await;

    let mut o1 = open(addr, None).await;
    let mut o2 = open(addr, None).await;
    join(&mut o1).await;
    join(&mut o2).await;

    let mut worker = open(addr, None).await;
    send(&mut worker, sample("u1", 13.08, 80.27)).await;

    for observer in [&mut o1, &mut o2] {
        match next_event(observer).await {
            ServerEvent::SubjectUpdate(update) => {
                assert_eq!(update.subject_id, "u1");
                assert_eq!(update.latitude, 13.08);
                assert_eq!(update.longitude, 80.27);
            }
            other => panic!("expected subject-update, got {other:?}"),
        }
    }
    match next_event(&mut worker).await {
        ServerEvent::LocationAck(ack) => assert_eq!(ack.observers_reached, 2),
        other => panic!("expected location-ack, got {other:?}"),
    }

    o1.close(None).await.unwrap();
    drop(o1);
    wait_for_observers(&state, 1).await;

    send(&mut worker, sample("u1", 13.09, 80.28)).await;
    match next_event(&mut o2).await {
        ServerEvent::SubjectUpdate(update) => assert_eq!(update.latitude, 13.09),
        other => panic!("expected subject-update, got {other:?}"),
    }
    match next_event(&mut worker).await {
        ServerEvent::LocationAck(ack) => assert_eq!(ack.observers_reached, 1),
        other => panic!("expected location-ack, got {other:?}"),
    }
    assert_eq!(state.registry().observer_count(), 1);
}

#[test_timeout::tokio_timeout_test(20)]
async fn late_observer_gets_snapshot_and_departures() {
    let (addr, state) = spawn_server(permissive()).await;

    let mut worker = open(addr, None).await;
    send(&mut worker, sample("u9", -33.86, 151.2)).await;
    assert!(matches!(next_event(&mut worker).await, ServerEvent::LocationAck(_)));

    let mut observer = open(addr, None).await;
    send(&mut observer, ClientEvent::JoinObserver(JoinObserver::default())).await;
    match next_event(&mut observer).await {
        ServerEvent::SubjectSnapshot(list) => {
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].subject_id, "u9");
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    assert!(matches!(next_event(&mut observer).await, ServerEvent::ObserverJoined(_)));

    worker.close(None).await.unwrap();
    match next_event(&mut observer).await {
        ServerEvent::SubjectDeparted(departed) => assert_eq!(departed.subject_id, "u9"),
        other => panic!("expected departure, got {other:?}"),
    }
    assert_eq!(state.registry().subject_count(), 0);
}

#[test_timeout::tokio_timeout_test(20)]
async fn identity_is_enforced_when_required() {
    let (addr, _state) = spawn_server(PresenceConfig {
        require_identity: true,
        ..permissive()
    })
    .await;

    let anonymous = connect_async(format!("ws://{addr}/ws")).await;
    assert!(anonymous.is_err());
    let garbage = connect_async(format!("ws://{addr}/ws?token=%25%25")).await;
    assert!(garbage.is_err());

    let token = IdentityClaims::new("w-1", Role::Worker, TokenTtl::minutes(5))
        .encode()
        .unwrap();
    let mut worker = open(addr, Some(&token)).await;
    send(&mut worker, sample("w-2", 1.0, 1.0)).await;
    match next_event(&mut worker).await {
        ServerEvent::LocationRejected(rejection) => {
            assert_eq!(rejection.reason, "subject mismatch")
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    send(&mut worker, ClientEvent::JoinObserver(JoinObserver::default())).await;
    assert!(matches!(
        next_event(&mut worker).await,
        ServerEvent::ObserverJoinRejected(_)
    ));
}
