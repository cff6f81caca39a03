//! Virtual placeholder resolution: state updates and dependent requests.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use silentq::queue::record::RequestDescriptor;
use silentq::vdata::{access_path, virtualize, AccessMode, Key};
use silentq::{Config, SilentClient, StateCell, StateMatcher, SubmitOptions, TransportError, Value};

use fixtures::transport::MockTransport;

fn client(transport: &Arc<MockTransport>) -> SilentClient {
    SilentClient::builder()
        .transport(transport.clone())
        .config(Config::default())
        .build()
        .expect("build client")
}

/// Speculative `{id: <placeholder>}` response plus the wrapped id itself.
fn speculative_created() -> (Value, Value) {
    let mut vresp = virtualize(Value::object([("id", Value::Undefined)]));
    let wrapped_id = access_path(&mut vresp, &[Key::from("id")], AccessMode::Wrapping);
    (vresp, wrapped_id)
}

#[test]
fn success_resolves_placeholders_into_live_state() {
    let transport = MockTransport::new();
    transport.script("/create", Ok(Value::object([("id", Value::from(42))])));
    let client = client(&transport);

    let (vresp, wrapped_id) = speculative_created();

    // optimistic UI state holds the placeholder before the network settles
    let cell = StateCell::new(
        "todo-list",
        Value::object([("list", Value::array([wrapped_id]))]),
    );
    client.register_state(&cell);

    client
        .submit(
            RequestDescriptor::new("POST", "/create"),
            SubmitOptions {
                virtual_response: Some(vresp),
                ..SubmitOptions::default()
            },
        )
        .reconcile_into(StateMatcher::Exact("todo-list".into()), vec!["list".into()], |v| v)
        .send()
        .expect("send");

    assert!(client.wait_idle(Duration::from_secs(2)));

    let first = cell.get().get("list").and_then(|l| l.get_index(0)).cloned();
    assert_eq!(first.and_then(|v| v.as_i64()), Some(42));
}

#[test]
fn waiting_requests_see_resolved_values() {
    let transport = MockTransport::new();
    transport.set_latency("/create", Duration::from_millis(100));
    transport.script("/create", Ok(Value::object([("id", Value::from(42))])));
    let client = client(&transport);

    let (vresp, wrapped_id) = speculative_created();

    client
        .submit(
            RequestDescriptor::new("POST", "/create"),
            SubmitOptions {
                virtual_response: Some(vresp),
                ..SubmitOptions::default()
            },
        )
        .send()
        .expect("send create");

    // depends on the id the server has not returned yet
    client
        .submit(
            RequestDescriptor::new("PUT", "/update").with_body(Value::object([
                ("id", wrapped_id),
                ("done", Value::from(true)),
            ])),
            SubmitOptions::default(),
        )
        .send()
        .expect("send update");

    assert!(client.wait_idle(Duration::from_secs(2)));

    let calls = transport.calls();
    assert_eq!(transport.urls_called(), vec!["/create", "/update"]);
    assert_eq!(
        calls[1].body,
        Value::object([("id", Value::from(42)), ("done", Value::from(true))])
    );
}

#[test]
fn unresolved_placeholders_dehydrate_to_snapshots() {
    let transport = MockTransport::new();
    let client = client(&transport);

    client
        .submit(
            RequestDescriptor::new("POST", "/send")
                .with_body(Value::object([("count", virtualize(Value::from(7)))])),
            SubmitOptions::default(),
        )
        .send()
        .expect("send");

    assert!(client.wait_idle(Duration::from_secs(2)));

    // the transport sees plain data, never placeholders
    assert_eq!(
        transport.calls()[0].body,
        Value::object([("count", Value::from(7))])
    );
}

#[test]
fn failed_requests_discard_their_targets() {
    let transport = MockTransport::new();
    transport.script("/create", Err(TransportError::new("ServerError", "500")));
    let client = client(&transport);

    let (vresp, wrapped_id) = speculative_created();
    let cell = StateCell::new(
        "todo-list",
        Value::object([("list", Value::array([wrapped_id]))]),
    );
    client.register_state(&cell);

    client
        .submit(
            RequestDescriptor::new("POST", "/create"),
            SubmitOptions {
                virtual_response: Some(vresp),
                ..SubmitOptions::default()
            },
        )
        .reconcile_into(
            StateMatcher::Exact("todo-list".into()),
            vec!["list".into()],
            |_| Value::from("must not run"),
        )
        .send()
        .expect("send");

    assert!(client.wait_idle(Duration::from_secs(2)));

    // state keeps its optimistic placeholder; the transform never ran
    let first = cell.get().get("list").and_then(|l| l.get_index(0)).cloned();
    assert!(first.is_some_and(|v| v.is_virtual()));
}
