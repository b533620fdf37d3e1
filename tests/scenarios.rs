//! End-to-end subscription-engine behavior, driven through the full
//! inbound path: text frame -> parse -> responder pool -> dispatch ->
//! outbound channel.

mod support;

use serde_json::{Value, json};
use sideboard::registry::ServiceModule;
use sideboard::{Config, Server};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::next_frame;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(400);

/// A host with a `testservice` echo method and a `self` service holding a
/// mutable name list with subscribe/notify wiring.
fn subscription_host() -> (Arc<Server>, Arc<Mutex<Vec<String>>>) {
    let server = Server::new(Config::default());
    let names = Arc::new(Mutex::new(vec!["Hello".to_owned(), "World".to_owned()]));

    let mut testservice = ServiceModule::new();
    testservice
        .register_method("get_message", |params, _ctx| {
            let name: String = params.one()?;
            Ok(json!(format!("Hello {name}!")))
        })
        .expect("get_message registers");
    server.registry.register("testservice", testservice, false).expect("testservice registers");

    let mut own = ServiceModule::new();
    let reader = Arc::clone(&names);
    own.register_method("get_names", move |_params, _ctx| {
        Ok(json!(*reader.lock().expect("names lock")))
    })
    .expect("get_names registers")
    .subscribes(["names"]);
    let writer = Arc::clone(&names);
    own.register_method("change_name", move |params, _ctx| {
        let name: String = params.one()?;
        let mut names = writer.lock().expect("names lock");
        let last = names.len() - 1;
        names[last] = name;
        Ok(Value::Null)
    })
    .expect("change_name registers")
    .notifies(["names"]);
    server.registry.register("self", own, false).expect("self registers");

    (server, names)
}

// ---------------------------------------------------------------------------
// Scenario 1: echo, no subscription
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_shot_call_produces_exactly_one_frame_and_no_interest() {
    let (server, _names) = subscription_host();
    let (session, mut rx) = server.open_session(None);

    session.receive(r#"{"method":"testservice.get_message","params":["World"],"callback":"cb1"}"#);

    let frame = next_frame(&mut rx, WAIT).await.expect("reply frame");
    assert_eq!(frame, json!({"callback": "cb1", "data": "Hello World!"}));
    assert!(next_frame(&mut rx, QUIET).await.is_none(), "exactly one frame");
    assert!(server.bus.channels_for_socket(session.id()).is_empty(), "no channel interest");
}

// ---------------------------------------------------------------------------
// Scenario 2: subscribe, trigger, fingerprint dedup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscription_pushes_fresh_results_and_dedups_repeats() {
    let (server, _names) = subscription_host();
    let (socket_a, mut rx_a) = server.open_session(None);
    let (socket_b, mut rx_b) = server.open_session(None);

    // Subscribe on A: the initial reply is the first data push.
    socket_a.receive(r#"{"method":"self.get_names","client":"c1"}"#);
    let initial = next_frame(&mut rx_a, WAIT).await.expect("initial subscription reply");
    assert_eq!(
        initial,
        json!({"trigger": "subscribe", "client": "c1", "data": ["Hello", "World"]})
    );

    // Change the name from B: A gets a trigger push with the new data.
    socket_b.receive(r#"{"method":"self.change_name","params":["Kitty"],"callback":"cbB"}"#);
    let reply_b = next_frame(&mut rx_b, WAIT).await.expect("B's own reply");
    assert_eq!(reply_b, json!({"callback": "cbB"}), "null results carry no data key");

    let push = next_frame(&mut rx_a, WAIT).await.expect("trigger push on A");
    assert_eq!(
        push,
        json!({"trigger": "change_name", "client": "c1", "data": ["Hello", "Kitty"]})
    );

    // Same change again: the re-run result is byte-identical, so no frame.
    socket_b.receive(r#"{"method":"self.change_name","params":["Kitty"],"callback":"cbB2"}"#);
    next_frame(&mut rx_b, WAIT).await.expect("B's second reply");
    assert!(next_frame(&mut rx_a, QUIET).await.is_none(), "fingerprint match suppresses the push");
}

// ---------------------------------------------------------------------------
// Scenario 3: unsubscribe stops pushes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsubscribe_stops_trigger_pushes() {
    let (server, _names) = subscription_host();
    let (socket_a, mut rx_a) = server.open_session(None);
    let (socket_b, mut rx_b) = server.open_session(None);

    socket_a.receive(r#"{"method":"self.get_names","client":"c1"}"#);
    next_frame(&mut rx_a, WAIT).await.expect("initial reply");

    socket_a.receive(r#"{"action":"unsubscribe","client":"c1"}"#);
    // Wait until the unsubscribe has been processed by the pool.
    let deadline = tokio::time::Instant::now() + WAIT;
    while server.bus.has_interest(socket_a.id(), "c1", None) {
        assert!(tokio::time::Instant::now() < deadline, "unsubscribe should drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    socket_b.receive(r#"{"method":"self.change_name","params":["Dog"],"callback":"cbB"}"#);
    next_frame(&mut rx_b, WAIT).await.expect("B's reply");
    assert!(next_frame(&mut rx_a, QUIET).await.is_none(), "no further pushes after unsubscribe");
}

// ---------------------------------------------------------------------------
// Scenario 4: per-client serialization
// ---------------------------------------------------------------------------

fn latency_host() -> Arc<Server> {
    let server = Server::new(Config::default());
    let mut module = ServiceModule::new();
    module
        .register_async_method("slow_echo", |params, _ctx| async move {
            let value: String = params.one()?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(json!(value))
        })
        .expect("slow_echo registers");
    module
        .register_async_method("echo", |params, _ctx| async move {
            let value: String = params.one()?;
            Ok(json!(value))
        })
        .expect("echo registers");
    server.registry.register("svc", module, false).expect("svc registers");
    server
}

#[tokio::test(start_paused = true)]
async fn messages_sharing_a_client_are_processed_sequentially() {
    let server = latency_host();
    let (session, mut rx) = server.open_session(None);

    session.receive(r#"{"method":"svc.slow_echo","params":["foo"],"client":"c1","callback":"cb1"}"#);
    session.receive(r#"{"method":"svc.echo","params":["bar"],"client":"c1","callback":"cb2"}"#);

    let first = next_frame(&mut rx, WAIT).await.expect("first reply");
    let second = next_frame(&mut rx, WAIT).await.expect("second reply");
    assert_eq!(first, json!({"client": "c1", "callback": "cb1", "data": "foo"}));
    assert_eq!(second, json!({"client": "c1", "callback": "cb2", "data": "bar"}));
}

#[tokio::test(start_paused = true)]
async fn messages_with_distinct_clients_process_concurrently() {
    let server = latency_host();
    let (session, mut rx) = server.open_session(None);

    session.receive(r#"{"method":"svc.slow_echo","params":["foo"],"client":"c1","callback":"cb1"}"#);
    session.receive(r#"{"method":"svc.echo","params":["bar"],"client":"c2","callback":"cb2"}"#);

    let first = next_frame(&mut rx, WAIT).await.expect("first reply");
    assert_eq!(first, json!({"client": "c2", "callback": "cb2", "data": "bar"}));
    let second = next_frame(&mut rx, WAIT).await.expect("second reply");
    assert_eq!(second, json!({"client": "c1", "callback": "cb1", "data": "foo"}));
}

// ---------------------------------------------------------------------------
// Scenario 6: protocol errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_inputs_yield_error_frames_without_registry_mutation() {
    let (server, _names) = subscription_host();
    let (session, mut rx) = server.open_session(None);

    let inputs = [
        r#""x""#,
        "null",
        "[]",
        r#"{"method":"no_dot"}"#,
        r#"{"method":"too.many.dots"}"#,
        r#"{"method":"unknown.fn"}"#,
        r#"{"method":"service.fn","params":"not an object or list"}"#,
    ];
    for input in inputs {
        session.receive(input);
        let frame = next_frame(&mut rx, WAIT).await.expect("error frame");
        assert!(frame.get("error").is_some(), "input {input:?} should produce an error frame");
    }
    assert!(server.bus.channels_for_socket(session.id()).is_empty());
    assert!(session.subscribed_clients().is_empty());
}

// ---------------------------------------------------------------------------
// Universal invariants
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn delayed_notifies_do_not_trigger_before_the_delay() {
    let server = Server::new(Config::default());
    let counter = Arc::new(Mutex::new(0u32));

    let mut module = ServiceModule::new();
    let reader = Arc::clone(&counter);
    module
        .register_method("count", move |_p, _c| Ok(json!(*reader.lock().expect("count lock"))))
        .expect("count registers")
        .subscribes(["counts"]);
    let writer = Arc::clone(&counter);
    module
        .register_method("bump", move |_p, _c| {
            *writer.lock().expect("count lock") += 1;
            Ok(Value::Null)
        })
        .expect("bump registers")
        .notifies_delayed(["counts"], Duration::from_secs(3));
    server.registry.register("svc", module, false).expect("svc registers");

    let (socket_a, mut rx_a) = server.open_session(None);
    let (socket_b, mut rx_b) = server.open_session(None);
    socket_a.receive(r#"{"method":"svc.count","client":"c1"}"#);
    next_frame(&mut rx_a, WAIT).await.expect("initial reply");

    socket_b.receive(r#"{"method":"svc.bump","callback":"cb"}"#);
    next_frame(&mut rx_b, WAIT).await.expect("bump reply");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        rx_a.try_recv().is_err(),
        "no push before the declared fan-out delay has elapsed"
    );
    let push = next_frame(&mut rx_a, WAIT).await.expect("push after the delay");
    assert_eq!(push, json!({"trigger": "bump", "client": "c1", "data": 1}));
}

#[tokio::test]
async fn originating_client_is_excluded_from_fanout() {
    let (server, _names) = subscription_host();
    let (socket_a, mut rx_a) = server.open_session(None);

    // The same client both subscribes and later notifies: its own trigger
    // is skipped, so only the initial reply arrives.
    socket_a.receive(r#"{"method":"self.get_names","client":"c1"}"#);
    next_frame(&mut rx_a, WAIT).await.expect("initial reply");

    socket_a.receive(r#"{"method":"self.change_name","params":["Cat"],"client":"c1","callback":"cb"}"#);
    let reply = next_frame(&mut rx_a, WAIT).await.expect("own reply");
    assert_eq!(reply, json!({"client": "c1", "callback": "cb"}));
    assert!(next_frame(&mut rx_a, QUIET).await.is_none(), "self-notification is skipped");
}

#[tokio::test]
async fn client_data_snapshot_is_restored_on_trigger() {
    let server = Server::new(Config::default());
    let mut module = ServiceModule::new();
    module
        .register_method("watch", |_params, ctx| {
            // First call seeds the per-subscription scratch map; triggers
            // must observe the snapshot taken at subscribe time.
            let count = ctx.client_data_get("calls").and_then(|v| v.as_i64()).unwrap_or(0);
            ctx.client_data_set("calls", json!(count + 1));
            Ok(json!(count))
        })
        .expect("watch registers")
        .subscribes(["ch"]);
    module
        .register_method("poke", |_p, _c| Ok(Value::Null))
        .expect("poke registers")
        .notifies(["ch"]);
    server.registry.register("svc", module, false).expect("svc registers");

    let (socket_a, mut rx_a) = server.open_session(None);
    let (socket_b, mut rx_b) = server.open_session(None);

    socket_a.receive(r#"{"method":"svc.watch","client":"c1"}"#);
    let initial = next_frame(&mut rx_a, WAIT).await.expect("initial reply");
    assert_eq!(initial["data"], json!(0));

    // The snapshot captured at subscribe time has calls=1, so every
    // trigger re-run observes 1 and returns 1.
    socket_b.receive(r#"{"method":"svc.poke","callback":"cb"}"#);
    next_frame(&mut rx_b, WAIT).await.expect("poke reply");
    let push = next_frame(&mut rx_a, WAIT).await.expect("trigger push");
    assert_eq!(push["data"], json!(1));

    socket_b.receive(r#"{"method":"svc.poke","callback":"cb2"}"#);
    next_frame(&mut rx_b, WAIT).await.expect("second poke reply");
    assert!(
        next_frame(&mut rx_a, QUIET).await.is_none(),
        "stable snapshot makes repeat results identical, so the push dedups"
    );
}
