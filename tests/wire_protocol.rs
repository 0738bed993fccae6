use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use clashd::engine::Engine;
use clashd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("clashd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("clashd.wal")).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "clashd".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("clashd")
        .user("clashd")
        .password("clashd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// Run an INSERT and return the generated id.
async fn insert(client: &tokio_postgres::Client, sql: &str) -> u64 {
    let rows = rows(client, sql).await;
    assert_eq!(rows.len(), 1, "insert should return one id row");
    rows[0].get("id").unwrap().parse().unwrap()
}

async fn seed_rooms(client: &tokio_postgres::Client) -> (u64, u64) {
    let a = insert(client, "INSERT INTO resources (name, kind) VALUES ('Room A', 'room')").await;
    let b = insert(client, "INSERT INTO resources (name, kind) VALUES ('Room B', 'room')").await;
    (a, b)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_list_resources() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let (a, b) = seed_rooms(&client).await;
    assert!(a < b);

    let listed = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("name"), Some("Room A"));
    assert_eq!(listed[1].get("kind"), Some("room"));
}

#[tokio::test]
async fn overlapping_event_is_rejected() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (a, _) = seed_rooms(&client).await;

    insert(
        &client,
        &format!(
            r#"INSERT INTO events (title, start, "end", resources) VALUES ('Math101', '2024-01-01T09:30', '2024-01-01T11:00', '{a}')"#
        ),
    )
    .await;

    let err = client
        .simple_query(&format!(
            r#"INSERT INTO events (title, start, "end", resources) VALUES ('Physics', '2024-01-01T10:00', '2024-01-01T10:30', '{a}')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains("Math101"), "{message}");
    assert!(message.contains("Room A"), "{message}");

    assert_eq!(engine.event_count(), 1);
}

#[tokio::test]
async fn back_to_back_events_and_listing() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (a, b) = seed_rooms(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO events (title, start, "end", resources) VALUES ('Late', '2024-01-01T10:00', '2024-01-01T11:00', '{a},{b}')"#
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (title, start, "end", resources) VALUES ('Early', '2024-01-01T09:00', '2024-01-01T10:00', '{a}')"#
        ))
        .await
        .unwrap();

    let events = rows(&client, "SELECT * FROM events").await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].get("title"), Some("Early"));
    assert_eq!(events[0].get("start"), Some("2024-01-01T09:00"));
    assert_eq!(events[1].get("resources"), Some(format!("{a},{b}").as_str()));

    let allocations = rows(&client, &format!("SELECT * FROM allocations WHERE resource_id = {a}")).await;
    assert_eq!(allocations.len(), 2);

    assert!(rows(&client, "SELECT * FROM conflicts").await.is_empty());
}

#[tokio::test]
async fn update_keeps_unnamed_columns() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (a, b) = seed_rooms(&client).await;

    let id = insert(
        &client,
        &format!(
            r#"INSERT INTO events (title, start, "end", description, resources) VALUES ('Review', '2024-01-01T13:00', '2024-01-01T14:00', 'weekly', '{a}')"#
        ),
    )
    .await;

    client
        .batch_execute(&format!(
            r#"UPDATE events SET title = 'Design review', resources = '{b}' WHERE id = {id}"#
        ))
        .await
        .unwrap();

    let events = rows(&client, "SELECT * FROM events").await;
    assert_eq!(events[0].get("title"), Some("Design review"));
    assert_eq!(events[0].get("description"), Some("weekly"));
    assert_eq!(events[0].get("end"), Some("2024-01-01T14:00"));
    assert_eq!(events[0].get("resources"), Some(b.to_string().as_str()));
}

#[tokio::test]
async fn conflict_check_and_utilization() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (a, b) = seed_rooms(&client).await;

    let id = insert(
        &client,
        &format!(
            r#"INSERT INTO events (title, start, "end", resources) VALUES ('Lab', '2024-01-02T09:00', '2024-01-02T10:30', '{a}')"#
        ),
    )
    .await;

    let hits = rows(
        &client,
        &format!(
            r#"SELECT * FROM conflict_check WHERE start >= '2024-01-02T10:00' AND "end" <= '2024-01-02T11:00' AND resources = '{a},{b}'"#
        ),
    )
    .await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get("event_id"), Some(id.to_string().as_str()));
    assert_eq!(hits[0].get("resource_name"), Some("Room A"));

    let excluded = rows(
        &client,
        &format!(
            r#"SELECT * FROM conflict_check WHERE start >= '2024-01-02T10:00' AND "end" <= '2024-01-02T11:00' AND resources = '{a}' AND exclude_event_id = {id}"#
        ),
    )
    .await;
    assert!(excluded.is_empty());

    let report = rows(
        &client,
        r#"SELECT * FROM utilization WHERE start >= '2024-01-01T00:00' AND "end" <= '2024-02-01T00:00' AND now = '2024-01-01T12:00'"#,
    )
    .await;
    assert_eq!(report.len(), 2);
    let hours = |row: &SimpleQueryRow| -> f64 { row.get("total_hours").unwrap().parse().unwrap() };
    assert_eq!(hours(&report[0]), 1.5);
    assert_eq!(report[0].get("upcoming"), Some(id.to_string().as_str()));
    assert_eq!(hours(&report[1]), 0.0);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.simple_query("SELECT * FROM bookings").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = client
        .simple_query("DELETE FROM events WHERE id = 42")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));

    let err = client
        .simple_query(r#"INSERT INTO events (title, start, "end") VALUES ('x', '2024-01-01T10:00', '2024-01-01T09:00')"#)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
}

#[tokio::test]
async fn deleting_resource_cascades_over_the_wire() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (a, _) = seed_rooms(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO events (title, start, "end", resources) VALUES ('Solo', '2024-01-01T09:00', '2024-01-01T10:00', '{a}')"#
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM resources WHERE id = {a}"))
        .await
        .unwrap();

    assert!(rows(&client, "SELECT * FROM allocations").await.is_empty());
    assert_eq!(engine.event_count(), 1);
    assert_eq!(engine.resource_count(), 1);
}
