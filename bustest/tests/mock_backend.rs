//! Mock tasks against a real private bus and python-dbusmock.

use std::time::Duration;

use bustest::{BusTask, ErrorKind, MockTask, TaskState, Value, WaitOutcome};
use zbus::zvariant::{self, OwnedValue};

mod support;
use support::skip_if_no_dbusmock;

const READY: Duration = Duration::from_secs(20);

async fn get_property(
    conn: &zbus::Connection,
    name: &str,
) -> zbus::Result<zbus::Message> {
    conn.call_method(
        Some("foo.test"),
        "/test",
        Some("org.freedesktop.DBus.Properties"),
        "Get",
        &("foo.test.interface", name),
    )
    .await
}

#[tokio::test]
async fn mock_basic() {
    let Some(mut service) = skip_if_no_dbusmock() else {
        return;
    };
    let mock = MockTask::new("foo.test").unwrap();
    service.add_task(mock.clone()).unwrap();

    service.start_and_wait(READY).await.unwrap();
    assert_eq!(mock.state(), TaskState::Running);

    service.shutdown().await.unwrap();
    assert!(mock.state().is_terminal());
}

#[tokio::test]
async fn mock_properties() {
    let Some(mut service) = skip_if_no_dbusmock() else {
        return;
    };
    let mock = MockTask::new("foo.test").unwrap();
    let obj = mock.get_object("/test", "foo.test.interface").await.unwrap();

    mock.add_property(&obj, "prop1", "s", Value::from("test"))
        .await
        .unwrap();
    let err = mock
        .add_property(&obj, "prop2", "s", Value::from(5u32))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    mock.add_property(
        &obj,
        "prop3",
        "(sssss)",
        Value::tuple(["a", "b", "c", "d", "e"].map(Value::from)),
    )
    .await
    .unwrap();

    service.add_task(mock.clone()).unwrap();
    service.start_and_wait(READY).await.unwrap();
    assert_eq!(mock.state(), TaskState::Running);

    let conn = service.connect().await.unwrap();

    let reply = get_property(&conn, "prop1").await.unwrap();
    let value: OwnedValue = reply.body().deserialize().unwrap();
    assert_eq!(String::try_from(value).unwrap(), "test");

    assert!(get_property(&conn, "prop2").await.is_err());

    let reply = get_property(&conn, "prop3").await.unwrap();
    let body = reply.body();
    let value: zvariant::Value<'_> = body.deserialize().unwrap();
    let zvariant::Value::Structure(structure) = value else {
        panic!("prop3 is not a struct");
    };
    let fields: Vec<String> = structure
        .fields()
        .iter()
        .map(|field| String::try_from(field.try_clone().unwrap()).unwrap())
        .collect();
    assert_eq!(fields, vec!["a", "b", "c", "d", "e"]);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn mock_methods() {
    let Some(mut service) = skip_if_no_dbusmock() else {
        return;
    };
    let mock = MockTask::new("foo.test").unwrap();
    let obj = mock.get_object("/test", "foo.test.interface").await.unwrap();
    mock.add_method(&obj, "method1", "s", "s", "ret = 'test'")
        .await
        .unwrap();

    service.add_task(mock.clone()).unwrap();
    service.start_and_wait(READY).await.unwrap();

    let conn = service.connect().await.unwrap();
    let reply = conn
        .call_method(
            Some("foo.test"),
            "/test",
            Some("foo.test.interface"),
            "method1",
            &("testin",),
        )
        .await
        .unwrap();
    let ret: String = reply.body().deserialize().unwrap();
    assert_eq!(ret, "test");

    assert!(
        mock.check_method_call(&obj, "method1", &[Value::from("testin")])
            .await
            .unwrap()
    );
    mock.clear_method_calls(&obj).await.unwrap();
    assert!(mock.method_calls(&obj, "method1").await.unwrap().is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_operations_apply_in_order() {
    let Some(mut service) = skip_if_no_dbusmock() else {
        return;
    };
    let mock = MockTask::new("foo.test").unwrap();
    let obj = mock.get_object("/test", "foo.test.interface").await.unwrap();

    // A, B, C: C only makes sense after A.
    mock.add_property(&obj, "a", "s", Value::from("A"))
        .await
        .unwrap();
    mock.add_method(&obj, "b", "", "", "").await.unwrap();
    mock.set_property(&obj, "a", Value::from("C")).await.unwrap();
    assert_eq!(mock.pending_operations().await.len(), 3);

    service.add_task(mock.clone()).unwrap();
    service.start_and_wait(READY).await.unwrap();
    assert!(mock.pending_operations().await.is_empty());
    assert!(mock.is_consistent(&obj).await);

    let conn = service.connect().await.unwrap();
    let reply = get_property(&conn, "a").await.unwrap();
    let value: OwnedValue = reply.body().deserialize().unwrap();
    assert_eq!(String::try_from(value).unwrap(), "C");

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn live_declarations_apply_immediately() {
    let Some(mut service) = skip_if_no_dbusmock() else {
        return;
    };
    let mock = MockTask::new("foo.test").unwrap();
    service.add_task(mock.clone()).unwrap();
    service.start_and_wait(READY).await.unwrap();

    let obj = mock.get_object("/test", "foo.test.interface").await.unwrap();
    mock.add_property(&obj, "count", "u", Value::from(7u32))
        .await
        .unwrap();
    assert!(mock.pending_operations().await.is_empty());

    let conn = service.connect().await.unwrap();
    let reply = get_property(&conn, "count").await.unwrap();
    let value: OwnedValue = reply.body().deserialize().unwrap();
    assert_eq!(u32::try_from(value).unwrap(), 7);

    mock.set_property(&obj, "count", Value::from(8u32))
        .await
        .unwrap();
    let reply = get_property(&conn, "count").await.unwrap();
    let value: OwnedValue = reply.body().deserialize().unwrap();
    assert_eq!(u32::try_from(value).unwrap(), 8);
    assert_eq!(mock.property(&obj, "count").await, Some(Value::from(8u32)));

    mock.emit_signal(&obj, "Changed", "u", &[Value::from(8u32)])
        .await
        .unwrap();

    service.shutdown().await.unwrap();

    let err = mock
        .add_property(&obj, "late", "b", Value::from(true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnreachable);
}

#[tokio::test]
async fn missing_backend_is_reported_by_wait() {
    let Some(mut service) = support::skip_if_no_bus() else {
        return;
    };
    let mut config = service.config().clone();
    config.mock.python = "/nonexistent/bustest-python".to_string();
    service = bustest::Service::new(config).unwrap();

    let mock = MockTask::new("foo.test").unwrap();
    service.add_task(mock.clone()).unwrap();
    service.start_tasks().await.unwrap();

    let started = std::time::Instant::now();
    let outcome = service.wait_for_running(Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    match outcome {
        WaitOutcome::TaskFailed { task, failure } => {
            assert_eq!(task.as_str(), "foo.test");
            assert_eq!(failure.unwrap().kind, ErrorKind::LaunchFailed);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(mock.state(), TaskState::Error);

    service.shutdown().await.unwrap();
    service.shutdown().await.unwrap();
}
