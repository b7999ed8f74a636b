use kanban_sync::stream::mock::{MockConnector, MockSession};
use kanban_sync::{
    Entity, EntityId, ResourceHandle, ResourceKey, ResourceKind, ResourceView, StaticTokenProvider,
    StreamPhase, SyncClient, SyncConfig, SyncError, TransportMode,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Harness ──────────────────────────────────────────────────────

struct Harness {
    server: MockServer,
    connector: MockConnector,
    client: SyncClient,
}

async fn harness(configure: impl FnOnce(&mut SyncConfig, &MockServer)) -> Harness {
    harness_with_tokens(StaticTokenProvider::new("tok"), configure).await
}

async fn harness_with_tokens(
    tokens: StaticTokenProvider,
    configure: impl FnOnce(&mut SyncConfig, &MockServer),
) -> Harness {
    let server = MockServer::start().await;
    let connector = MockConnector::new();
    let mut config = SyncConfig {
        local_base_url: server.uri(),
        ..SyncConfig::default()
    };
    configure(&mut config, &server);

    let client = SyncClient::builder(config)
        .tokens(Arc::new(tokens))
        .connector(Arc::new(connector.clone()))
        .build()
        .unwrap();
    Harness {
        server,
        connector,
        client,
    }
}

fn local(_: &mut SyncConfig, _: &MockServer) {}

fn remote(config: &mut SyncConfig, server: &MockServer) {
    config.api_base_url = Some(server.uri());
}

fn key() -> ResourceKey {
    ResourceKey::projects(Some("ws-1"))
}

fn id(s: &str) -> EntityId {
    EntityId::new(s)
}

fn project(id: &str, name: &str) -> Entity {
    Entity::from_value(json!({ "id": id, "name": name })).unwrap()
}

fn created(id: &str, at: &str) -> Value {
    json!({ "id": id, "name": id, "created_at": at })
}

fn snapshot(entities: &[Value]) -> Value {
    let projects: serde_json::Map<String, Value> = entities
        .iter()
        .map(|e| (e["id"].as_str().unwrap_or_default().to_string(), e.clone()))
        .collect();
    json!({ "projects": projects })
}

fn envelope(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": data }))
}

async fn wait_view(
    handle: &mut ResourceHandle,
    predicate: impl Fn(&ResourceView) -> bool,
) -> ResourceView {
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for(predicate))
        .await
        .expect("view did not reach the expected state")
        .unwrap()
}

/// Waits until the server side of the feed (ignoring optimistic entries)
/// satisfies `predicate`.
async fn wait_server(handle: &mut ResourceHandle, predicate: impl Fn(&kanban_sync::ResourceState) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.feed().state.as_deref().is_some_and(&predicate) {
                return;
            }
            handle.changed().await.unwrap();
        }
    })
    .await
    .expect("server state did not reach the expected state");
}

async fn streaming(h: &Harness, entities: &[Value]) -> (ResourceHandle, MockSession) {
    let mut handle = h.client.resource(key());
    let session = h.connector.wait_for_session(0).await;
    session.send_json(&snapshot(entities));
    wait_view(&mut handle, |v| !v.is_loading).await;
    (handle, session)
}

// ── Modes ────────────────────────────────────────────────────────

#[tokio::test]
async fn handles_pick_the_selected_transport() {
    let h = harness(local).await;
    let projects = h.client.resource(key());
    let issues = h.client.resource(ResourceKey::team_issues("t1").unwrap());

    assert_eq!(projects.mode(), TransportMode::Stream);
    assert_eq!(issues.mode(), TransportMode::Fetch);
    assert_eq!(projects.key(), &key());
}

#[tokio::test]
async fn remote_deployment_fetches_projects() {
    let h = harness(remote).await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(envelope(json!([created("p1", "2026-01-01T00:00:00Z")])))
        .expect(1)
        .mount(&h.server)
        .await;

    let mut handle = h.client.resource(key());
    assert_eq!(handle.mode(), TransportMode::Fetch);
    let view = wait_view(&mut handle, |v| !v.is_loading).await;

    assert_eq!(view.len(), 1);
    assert!(view.is_connected);
    assert_eq!(h.connector.attempts(), 0);
}

// ── Views ────────────────────────────────────────────────────────

#[tokio::test]
async fn view_is_loading_until_first_snapshot() {
    let h = harness(local).await;
    let mut handle = h.client.resource(key());

    let view = handle.view();
    assert!(view.is_loading);
    assert!(!view.is_connected);
    assert!(view.is_empty());

    let session = h.connector.wait_for_session(0).await;
    session.send_json(&snapshot(&[created("p1", "2026-01-01T00:00:00Z")]));
    let view = wait_view(&mut handle, |v| !v.is_loading).await;
    assert!(view.is_connected);
    assert!(view.contains(&id("p1")));
}

#[tokio::test]
async fn items_are_sorted_newest_first() {
    let h = harness(local).await;
    let (handle, _session) = streaming(
        &h,
        &[
            created("old", "2025-06-01T00:00:00Z"),
            created("new", "2026-03-01T12:00:00+02:00"),
            json!({ "id": "undated", "name": "undated" }),
            created("mid", "2026-01-15T00:00:00Z"),
            created("mid-twin", "2026-01-15T00:00:00Z"),
        ],
    )
    .await;

    let order: Vec<String> = handle
        .view()
        .items
        .iter()
        .map(|e| e.id().to_string())
        .collect();
    assert_eq!(order, vec!["new", "mid", "mid-twin", "old", "undated"]);
}

#[tokio::test]
async fn optimistic_entries_show_before_first_snapshot() {
    let h = harness(local).await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(envelope(json!({ "id": "p1", "name": "Alpha" })))
        .mount(&h.server)
        .await;

    let handle = h.client.resource(key());
    handle.add(project("p1", "Alpha")).await.unwrap();

    let view = handle.view();
    assert!(view.is_loading);
    assert!(view.contains(&id("p1")));
}

// ── Optimistic create ────────────────────────────────────────────

#[tokio::test]
async fn optimistic_create_then_confirm() {
    let h = harness(local).await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(
            envelope(created("p2", "2026-02-01T00:00:00Z")).set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    let (mut handle, session) = streaming(&h, &[created("p1", "2026-01-01T00:00:00Z")]).await;

    let (result, during) = tokio::join!(handle.add(project("p2", "p2")), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.view()
    });
    let server_copy = result.unwrap();

    // Visible while the request was in flight.
    assert!(during.contains(&id("p2")));
    assert_eq!(during.len(), 2);

    // Still pending until the stream reports it.
    assert!(h.client.store().contains(&key(), &id("p2")));
    assert_eq!(handle.view().get(&id("p2")), Some(&server_copy));

    session.send_json(&json!([
        { "op": "add", "path": "/projects/p2", "value": server_copy.as_value() }
    ]));
    wait_server(&mut handle, |s| s.contains(&id("p2"))).await;

    let view = handle.view();
    assert_eq!(view.len(), 2);
    assert_eq!(view.items[0].id(), &id("p2"));
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn stale_snapshot_does_not_revert_update_in_flight() {
    let h = harness(local).await;
    Mock::given(method("PUT"))
        .and(path("/api/projects/p1"))
        .respond_with(
            envelope(json!({ "id": "p1", "name": "New" })).set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    let (mut handle, session) = streaming(&h, &[json!({ "id": "p1", "name": "Old" })]).await;

    let (result, during) = tokio::join!(handle.update(project("p1", "New")), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A publication that predates the write.
        session.send_json(&snapshot(&[json!({ "id": "p1", "name": "Old" })]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.view()
    });
    result.unwrap();
    assert_eq!(during.get(&id("p1")), Some(&project("p1", "New")));
    assert_eq!(handle.view().get(&id("p1")), Some(&project("p1", "New")));

    session.send_json(&json!([{ "op": "replace", "path": "/projects/p1/name", "value": "New" }]));
    wait_server(&mut handle, |s| {
        s.get(&id("p1")).and_then(|e| e.get("name")) == Some(&json!("New"))
    })
    .await;
    handle.view();
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn update_already_streamed_is_resolved_on_response() {
    let h = harness(local).await;
    Mock::given(method("PUT"))
        .and(path("/api/projects/p1"))
        .respond_with(
            envelope(json!({ "id": "p1", "name": "New" })).set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    let (handle, session) = streaming(&h, &[json!({ "id": "p1", "name": "Old" })]).await;

    let (result, _) = tokio::join!(handle.update(project("p1", "New")), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.send_json(&json!([{ "op": "replace", "path": "/projects/p1/name", "value": "New" }]));
    });
    result.unwrap();

    assert!(h.client.store().is_empty(&key()));
    assert_eq!(handle.view().get(&id("p1")), Some(&project("p1", "New")));
}

// ── Removal ──────────────────────────────────────────────────────

#[tokio::test]
async fn remove_hides_entity_until_server_drops_it() {
    let h = harness(local).await;
    Mock::given(method("DELETE"))
        .and(path("/api/projects/p1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&h.server)
        .await;
    let (mut handle, session) = streaming(
        &h,
        &[
            json!({ "id": "p1", "name": "p1" }),
            json!({ "id": "p2", "name": "p2" }),
        ],
    )
    .await;

    handle.remove(&id("p1")).await.unwrap();
    assert!(!handle.view().contains(&id("p1")));
    assert!(h.client.store().contains(&key(), &id("p1")));

    session.send_json(&json!([{ "op": "remove", "path": "/projects/p1" }]));
    wait_server(&mut handle, |s| !s.contains(&id("p1"))).await;

    let view = handle.view();
    assert_eq!(view.len(), 1);
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn removal_already_streamed_is_resolved_on_response() {
    let h = harness(local).await;
    Mock::given(method("DELETE"))
        .and(path("/api/projects/p1"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&h.server)
        .await;
    let (handle, session) = streaming(&h, &[json!({ "id": "p1", "name": "p1" })]).await;

    let p1 = id("p1");
    let (result, _) = tokio::join!(handle.remove(&p1), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.send_json(&json!([{ "op": "remove", "path": "/projects/p1" }]));
    });
    result.unwrap();

    assert!(h.client.store().is_empty(&key()));
    assert!(handle.view().is_empty());
}

// ── Failures ─────────────────────────────────────────────────────

#[tokio::test]
async fn failed_mutation_keeps_entry_by_default() {
    let h = harness(local).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&h.server)
        .await;
    let (mut handle, session) = streaming(&h, &[]).await;

    let err = handle.add(project("p1", "Alpha")).await.unwrap_err();
    match &err {
        SyncError::Mutation { id: failed, source } => {
            assert_eq!(failed, &id("p1"));
            assert!(matches!(**source, SyncError::Fetch { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }

    // A newer server state without the entity does not drop it.
    session.send_json(&snapshot(&[json!({ "id": "p9", "name": "p9" })]));
    let view = wait_view(&mut handle, |v| v.contains(&id("p9"))).await;
    assert!(view.contains(&id("p1")));
    assert!(h.client.store().contains(&key(), &id("p1")));
}

#[tokio::test]
async fn failed_update_yields_to_newer_server_state() {
    let h = harness(local).await;
    Mock::given(method("PUT"))
        .and(path("/api/projects/p1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&h.server)
        .await;
    let (mut handle, session) = streaming(&h, &[json!({ "id": "p1", "name": "Old" })]).await;

    handle.update(project("p1", "Mine")).await.unwrap_err();
    assert_eq!(handle.view().get(&id("p1")), Some(&project("p1", "Mine")));

    session.send_json(&json!([
        { "op": "replace", "path": "/projects/p1/name", "value": "Theirs" },
        { "op": "add", "path": "/projects/p2", "value": { "id": "p2", "name": "p2" } }
    ]));
    wait_server(&mut handle, |s| s.contains(&id("p2"))).await;

    let view = handle.view();
    assert_eq!(view.get(&id("p1")), Some(&project("p1", "Theirs")));
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn failed_mutation_rolls_back_when_configured() {
    let h = harness(|config, _| config.rollback_on_error = true).await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(422)
                .set_body_json(json!({ "success": false, "message": "name taken" })),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    let (handle, _session) = streaming(&h, &[]).await;

    let err = handle.add(project("p1", "Alpha")).await.unwrap_err();
    assert!(err.to_string().contains("p1"));
    assert!(!handle.view().contains(&id("p1")));
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn signed_out_mutation_fails_without_request() {
    let h = harness_with_tokens(StaticTokenProvider::signed_out(), local).await;
    Mock::given(method("POST"))
        .respond_with(envelope(json!({})))
        .expect(0)
        .mount(&h.server)
        .await;
    let handle = h.client.resource(key());

    let err = handle.add(project("p1", "Alpha")).await.unwrap_err();
    match err {
        SyncError::Mutation { source, .. } => assert!(matches!(*source, SyncError::Auth(_))),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rate_limited_mutation_surfaces_retry_after() {
    let h = harness(remote).await;
    Mock::given(method("GET"))
        .respond_with(envelope(json!([])))
        .mount(&h.server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "9"))
        .expect(1)
        .mount(&h.server)
        .await;
    let mut handle = h.client.resource(key());
    wait_view(&mut handle, |v| !v.is_loading).await;

    let err = handle.update(project("p1", "Alpha")).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(9)));
}

// ── Fetch mode ───────────────────────────────────────────────────

#[tokio::test]
async fn fetch_mode_create_patches_cache_and_confirms() {
    let h = harness(remote).await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(envelope(json!([{ "id": "p1", "name": "p1" }])))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(envelope(created("p2", "2026-02-01T00:00:00Z")))
        .expect(1)
        .mount(&h.server)
        .await;

    let mut handle = h.client.resource(key());
    wait_view(&mut handle, |v| !v.is_loading).await;

    let server_copy = handle.add(project("p2", "p2")).await.unwrap();

    let cached = h.client.cache().peek(&key()).unwrap();
    assert_eq!(cached.get(&id("p2")), Some(&server_copy));

    let view = handle.view();
    assert_eq!(view.len(), 2);
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn fetch_mode_remove_confirms_tombstone() {
    let h = harness(remote).await;
    Mock::given(method("GET"))
        .respond_with(envelope(json!([{ "id": "p1", "name": "p1" }])))
        .mount(&h.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/projects/p1"))
        .respond_with(envelope(Value::Null))
        .expect(1)
        .mount(&h.server)
        .await;

    let mut handle = h.client.resource(key());
    wait_view(&mut handle, |v| v.contains(&id("p1"))).await;

    handle.remove(&id("p1")).await.unwrap();
    assert!(handle.view().is_empty());
    assert!(h.client.store().is_empty(&key()));
}

#[tokio::test]
async fn team_issues_use_task_endpoints() {
    let h = harness(local).await;
    Mock::given(method("GET"))
        .and(path("/api/teams/t1/issues"))
        .respond_with(envelope(json!([{ "id": "i1", "title": "Bug" }])))
        .mount(&h.server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/i1"))
        .respond_with(envelope(json!({ "id": "i1", "title": "Fixed" })))
        .expect(1)
        .mount(&h.server)
        .await;

    let issues = ResourceKey::team_issues("t1").unwrap();
    let mut handle = h.client.resource(issues.clone());
    wait_view(&mut handle, |v| v.contains(&id("i1"))).await;

    let issue = Entity::from_value(json!({ "id": "i1", "title": "Fixed" })).unwrap();
    handle.update(issue.clone()).await.unwrap();
    assert_eq!(handle.view().get(&id("i1")), Some(&issue));
}

// ── Client events ────────────────────────────────────────────────

#[tokio::test]
async fn invalidating_without_observers_sends_no_requests() {
    let h = harness(remote).await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(envelope(json!([])))
        .expect(1)
        .mount(&h.server)
        .await;

    {
        let mut handle = h.client.resource(key());
        wait_view(&mut handle, |v| !v.is_loading).await;
    }
    h.client.invalidate(ResourceKind::Projects);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.client.cache().is_stale(&key()));
}

#[tokio::test]
async fn invalidating_observed_fetch_feed_refetches() {
    let h = harness(remote).await;
    Mock::given(method("GET"))
        .respond_with(envelope(json!([{ "id": "p1", "name": "p1" }])))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .respond_with(envelope(json!([])))
        .mount(&h.server)
        .await;

    let mut handle = h.client.resource(key());
    wait_view(&mut handle, |v| v.contains(&id("p1"))).await;
    h.client.invalidate(ResourceKind::Projects);
    wait_view(&mut handle, |v| v.is_empty()).await;
}

#[tokio::test]
async fn auth_change_resyncs_streams() {
    let tokens = Arc::new(StaticTokenProvider::new("old"));
    let server = MockServer::start().await;
    let connector = MockConnector::new();
    let client = SyncClient::builder(SyncConfig {
        local_base_url: server.uri(),
        ..SyncConfig::default()
    })
    .tokens(tokens.clone())
    .connector(Arc::new(connector.clone()))
    .build()
    .unwrap();

    let _handle = client.resource(key());
    let first = connector.wait_for_session(0).await;
    assert!(first.url().contains("token=old"));

    tokens.set_token("new");
    client.notify_auth_changed();
    let second = tokio::time::timeout(Duration::from_secs(5), connector.wait_for_session(1))
        .await
        .unwrap();
    assert!(second.url().contains("token=new"));
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_stream() {
    let h = harness(local).await;
    let first = h.client.resource(key());
    let second = h.client.resource(key());
    let session = h.connector.wait_for_session(0).await;
    session.send_json(&snapshot(&[]));

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_ne!(h.client.stream_phase(&key()), Some(StreamPhase::Closed));

    drop(second);
    assert_eq!(h.client.stream_phase(&key()), Some(StreamPhase::Closed));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!session.is_open());
    assert_eq!(h.connector.connections(), 1);
}

#[tokio::test]
async fn store_writes_wake_waiters() {
    let h = harness(local).await;
    let (mut handle, _session) = streaming(&h, &[]).await;

    let store = Arc::clone(h.client.store());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.add(&key(), project("p5", "p5"));
    });

    let view = wait_view(&mut handle, |v| v.contains(&id("p5"))).await;
    assert_eq!(view.len(), 1);
}
