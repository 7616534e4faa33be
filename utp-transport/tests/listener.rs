//! Accept gate and two-phase listener shutdown against a scripted engine.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::*;
use tokio::sync::mpsc;
use tokio::time::timeout;
use utp_transport::{
    AcceptAll, ChannelProtocol, Connection, Error, Event, Listener, Protocol, SinglePeer,
    SocketHandle,
};

#[tokio::test]
async fn accept_and_data_in_one_datagram() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, _script, mut accepted) = listen_scripted(config(), AcceptAll).await;

    driver
        .send(listener.local_addr(), "accept 7; data 7 hello; eof 7")
        .await;

    let (conn, mut events) = next_accepted(&mut accepted).await;
    assert_eq!(conn.handle(), SocketHandle(7));
    assert_eq!(conn.peer_addr(), driver.addr());
    assert_eq!(conn.local_addr(), listener.local_addr());

    assert!(matches!(next_event(&mut events).await, Event::Established));
    assert!(matches!(next_event(&mut events).await, Event::Data(d) if d == b"hello"));
    assert!(matches!(next_event(&mut events).await, Event::Eof));
    assert!(matches!(next_event(&mut events).await, Event::Lost(None)));
}

#[tokio::test]
async fn accepted_connection_is_writable_immediately() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, script, mut accepted) = listen_scripted(config(), AcceptAll).await;

    driver.send(listener.local_addr(), "accept 4").await;
    let (conn, mut events) = next_accepted(&mut accepted).await;
    assert!(matches!(next_event(&mut events).await, Event::Established));

    conn.write(b"greeting").await.expect("write");
    assert_eq!(script.lock().written(SocketHandle(4)), b"greeting");
}

#[tokio::test]
async fn single_peer_policy_rejects_second_attempt() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, script, mut accepted) = listen_scripted(config(), SinglePeer).await;

    driver.send(listener.local_addr(), "accept 1; accept 2").await;

    let (conn, _events) = next_accepted(&mut accepted).await;
    assert_eq!(conn.handle(), SocketHandle(1));
    eventually("rejection", || script.lock().rejected() == 1).await;
    assert!(accepted.try_recv().is_err());
}

#[tokio::test]
async fn policy_sees_the_peer_address() {
    init_logging();
    let driver = Driver::new().await;
    let expected = driver.addr();
    let (listener, script, mut accepted) =
        listen_scripted(config(), move |peer: SocketAddr, _active: usize| peer == expected).await;

    let stranger = Driver::new().await;
    stranger.send(listener.local_addr(), "accept 1").await;
    eventually("stranger rejected", || script.lock().rejected() == 1).await;

    driver.send(listener.local_addr(), "accept 2").await;
    let (conn, _events) = next_accepted(&mut accepted).await;
    assert_eq!(conn.peer_addr(), expected);
}

#[tokio::test]
async fn close_waits_for_every_connection() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, script, mut accepted) = listen_scripted(config(), AcceptAll).await;
    script.lock().destroy_on_close = false;

    driver.send(listener.local_addr(), "accept 1; accept 2").await;
    let (first, mut first_events) = next_accepted(&mut accepted).await;
    let (_second, mut second_events) = next_accepted(&mut accepted).await;
    assert!(matches!(next_event(&mut first_events).await, Event::Established));
    assert!(matches!(next_event(&mut second_events).await, Event::Established));

    listener.close();
    eventually("both closed", || {
        let shared = script.lock();
        shared.count(&Call::Close(SocketHandle(1))) == 1
            && shared.count(&Call::Close(SocketHandle(2))) == 1
    })
    .await;
    assert!(
        timeout(Duration::from_millis(100), listener.wait_closed())
            .await
            .is_err(),
        "connections are still draining"
    );

    driver.send(listener.local_addr(), "accept 3").await;
    eventually("late attempt rejected", || script.lock().rejected() == 1).await;

    driver.send(listener.local_addr(), "destroy 1").await;
    assert!(matches!(next_event(&mut first_events).await, Event::Lost(None)));
    first.wait_closed().await.expect("first closed");
    assert!(
        timeout(Duration::from_millis(100), listener.wait_closed())
            .await
            .is_err(),
        "second connection is still draining"
    );

    driver.send(listener.local_addr(), "destroy 2").await;
    assert!(matches!(next_event(&mut second_events).await, Event::Lost(None)));
    timeout(WAIT, listener.wait_closed())
        .await
        .expect("listener finished")
        .expect("clean shutdown");
    eventually("engine destroyed", || script.lock().count(&Call::Destroy) == 1).await;
}

#[tokio::test]
async fn close_is_idempotent_and_empty_listener_finishes() {
    init_logging();
    let (listener, script, _accepted) = listen_scripted(config(), AcceptAll).await;

    listener.close();
    listener.close();
    timeout(WAIT, listener.wait_closed())
        .await
        .expect("listener finished")
        .expect("clean shutdown");
    eventually("engine destroyed", || script.lock().count(&Call::Destroy) == 1).await;
}

#[tokio::test]
async fn dropping_the_listener_closes_it() {
    init_logging();
    let (listener, script, _accepted) = listen_scripted(config(), AcceptAll).await;
    drop(listener);
    eventually("engine destroyed", || script.lock().count(&Call::Destroy) == 1).await;
}

#[tokio::test]
async fn connection_closed_by_application_leaves_listener_open() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, script, mut accepted) = listen_scripted(config(), SinglePeer).await;

    driver.send(listener.local_addr(), "accept 1").await;
    let (conn, mut events) = next_accepted(&mut accepted).await;
    assert!(matches!(next_event(&mut events).await, Event::Established));
    conn.close();
    assert!(matches!(next_event(&mut events).await, Event::Lost(None)));

    // The slot is free again for the single-peer gate.
    driver.send(listener.local_addr(), "accept 2").await;
    let (next, _events) = next_accepted(&mut accepted).await;
    assert_eq!(next.handle(), SocketHandle(2));
    assert_eq!(script.lock().rejected(), 0);
}

#[tokio::test]
async fn factory_runs_outside_engine_calls() {
    init_logging();
    let driver = Driver::new().await;
    let (engine, script) = ScriptEngine::new();
    let observed = script.clone();
    let (tx, mut built) = mpsc::unbounded_channel();
    let listener = Listener::bind_with_engine(
        config(),
        engine,
        AcceptAll,
        move |conn: &Connection| -> Box<dyn Protocol> {
            let _ = tx.send((conn.handle(), observed.lock().in_engine));
            Box::new(ChannelProtocol::new().0)
        },
    )
    .await
    .expect("bind");

    driver.send(listener.local_addr(), "accept 5; data 5 early").await;
    let (handle, inside) = timeout(WAIT, built.recv())
        .await
        .expect("factory called")
        .expect("listener alive");
    assert_eq!(handle, SocketHandle(5));
    assert!(!inside, "factory ran inside process_datagram");
}

#[tokio::test]
async fn socket_failure_loses_every_connection() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, script, mut accepted) = listen_scripted(config(), AcceptAll).await;

    driver.send(listener.local_addr(), "accept 1; accept 2").await;
    let (first, mut first_events) = next_accepted(&mut accepted).await;
    let (second, mut second_events) = next_accepted(&mut accepted).await;
    assert!(matches!(next_event(&mut first_events).await, Event::Established));
    assert!(matches!(next_event(&mut second_events).await, Event::Established));

    driver.send(listener.local_addr(), "broadcast 1").await;
    for events in [&mut first_events, &mut second_events] {
        assert!(matches!(
            next_event(events).await,
            Event::Lost(Some(Error::Socket(_)))
        ));
    }
    assert!(matches!(first.wait_closed().await, Err(Error::Socket(_))));
    assert!(matches!(second.wait_closed().await, Err(Error::Socket(_))));
    assert!(matches!(
        timeout(WAIT, listener.wait_closed())
            .await
            .expect("listener finished"),
        Err(Error::Socket(_))
    ));
    eventually("engine destroyed", || script.lock().count(&Call::Destroy) == 1).await;
}

#[tokio::test]
async fn closing_listener_flushes_final_datagrams() {
    init_logging();
    let driver = Driver::new().await;
    let (listener, script, mut accepted) = listen_scripted(config(), AcceptAll).await;
    script.lock().farewell = Some(driver.addr());

    driver.send(listener.local_addr(), "accept 3").await;
    let (_conn, mut events) = next_accepted(&mut accepted).await;
    assert!(matches!(next_event(&mut events).await, Event::Established));

    listener.close();
    assert!(matches!(next_event(&mut events).await, Event::Lost(None)));
    assert_eq!(driver.recv().await, "bye 3");
    timeout(WAIT, listener.wait_closed())
        .await
        .expect("listener finished")
        .expect("clean shutdown");
}
