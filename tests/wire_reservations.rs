use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use tablebook::engine::Engine;
use tablebook::notify::NotifyHub;
use tablebook::wire;

const H: i64 = 3_600_000;
const M: i64 = 60_000;
const PASSWORD: &str = "tablebook";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tablebook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("tablebook.wal"), Arc::new(NotifyHub::new())).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tablebook")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
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

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// Midnight two days from now.
fn day() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    (now / (24 * H) + 2) * 24 * H
}

/// Opens a verified restaurant with tables 1:2, 2:4, 3:6 as `owner`.
async fn open_restaurant(owner_client: &Client, owner: Ulid) -> Ulid {
    let rid = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO restaurants (id, owner_id, name, max_reservation_minutes, deposit) \
             VALUES ('{rid}', '{owner}', 'Da Mario', 120, 2000); \
             INSERT INTO verifications (restaurant_id) VALUES ('{rid}'); \
             INSERT INTO tables (restaurant_id, table_id, capacity) VALUES ('{rid}', 1, 2); \
             INSERT INTO tables (restaurant_id, table_id, capacity) VALUES ('{rid}', 2, 4); \
             INSERT INTO tables (restaurant_id, table_id, capacity) VALUES ('{rid}', 3, 6);"
        ))
        .await
        .unwrap();
    rid
}

async fn reserve(client: &Client, rid: Ulid, party: u32, start: i64, end: i64) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, restaurant_id, party_size, start, "end") VALUES ('{id}', '{rid}', {party}, {start}, {end})"#
        ))
        .await
        .map(|()| id)
}

async fn visit_table(client: &Client, visit_id: Ulid) -> Option<String> {
    let rows = select(client, &format!("SELECT * FROM visits WHERE id = '{visit_id}'")).await;
    assert_eq!(rows.len(), 1);
    rows[0].get("table_id").map(str::to_string)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reservations_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let owner = Ulid::new();
    let owner_client = connect(addr, &owner.to_string()).await;
    let rid = open_restaurant(&owner_client, owner).await;
    let d = day();

    let guest_a = connect(addr, &Ulid::new().to_string()).await;
    let guest_b = connect(addr, &Ulid::new().to_string()).await;
    let guest_c = connect(addr, &Ulid::new().to_string()).await;

    let on_b = reserve(&guest_a, rid, 3, d + 18 * H, d + 19 * H).await.unwrap();
    assert_eq!(visit_table(&owner_client, on_b).await.as_deref(), Some("2"));

    let on_c = reserve(&guest_b, rid, 3, d + 18 * H + 30 * M, d + 19 * H + 30 * M)
        .await
        .unwrap();
    assert_eq!(visit_table(&owner_client, on_c).await.as_deref(), Some("3"));

    let on_a = reserve(&guest_c, rid, 2, d + 17 * H, d + 18 * H).await.unwrap();
    assert_eq!(visit_table(&owner_client, on_a).await.as_deref(), Some("1"));

    let err = reserve(&guest_c, rid, 2, d + 12 * H, d + 12 * H + 10 * M)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = reserve(&guest_a, rid, 2, d + 18 * H, d + 19 * H).await.unwrap_err();
    assert_eq!(sqlstate(&err), "40001");

    let visits = select(&owner_client, &format!("SELECT * FROM visits WHERE restaurant_id = '{rid}'")).await;
    assert_eq!(visits.len(), 3);
    assert!(visits.iter().all(|row| row.get("status") == Some("pending")));
    assert!(visits.iter().all(|row| row.get("deposit") == Some("2000")));
}

#[tokio::test]
async fn available_tables_query() {
    let (addr, _engine) = start_test_server().await;
    let owner = Ulid::new();
    let owner_client = connect(addr, &owner.to_string()).await;
    let rid = open_restaurant(&owner_client, owner).await;
    let d = day();

    let guest = connect(addr, &Ulid::new().to_string()).await;
    reserve(&guest, rid, 3, d + 18 * H, d + 19 * H).await.unwrap();

    let rows = select(
        &guest,
        &format!(
            r#"SELECT * FROM available_tables WHERE restaurant_id = '{rid}' AND party_size = 2 AND start >= {} AND "end" <= {}"#,
            d + 18 * H + 30 * M,
            d + 19 * H + 30 * M
        ),
    )
    .await;
    let ids: Vec<&str> = rows.iter().filter_map(|r| r.get("table_id")).collect();
    assert_eq!(ids, vec!["1", "3"]);
}

#[tokio::test]
async fn hall_staff_lifecycle() {
    let (addr, _engine) = start_test_server().await;
    let owner = Ulid::new();
    let owner_client = connect(addr, &owner.to_string()).await;
    let rid = open_restaurant(&owner_client, owner).await;
    let waiter = Ulid::new();
    owner_client
        .batch_execute(&format!(
            "INSERT INTO employees (restaurant_id, user_id, hall_access) VALUES ('{rid}', '{waiter}', true)"
        ))
        .await
        .unwrap();
    let waiter_client = connect(addr, &waiter.to_string()).await;
    let guest = connect(addr, &Ulid::new().to_string()).await;
    let d = day();

    let visit = reserve(&guest, rid, 2, d + 18 * H, d + 19 * H).await.unwrap();

    let err = guest
        .batch_execute(&format!(
            "INSERT INTO visit_transitions (visit_id, action) VALUES ('{visit}', 'approve')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    waiter_client
        .batch_execute(&format!(
            "INSERT INTO visit_transitions (visit_id, action) VALUES ('{visit}', 'approve'); \
             INSERT INTO table_assignments (visit_id, table_id) VALUES ('{visit}', 3);"
        ))
        .await
        .unwrap();
    assert_eq!(visit_table(&guest, visit).await.as_deref(), Some("3"));

    let err = waiter_client
        .batch_execute(&format!(
            "INSERT INTO visit_transitions (visit_id, action) VALUES ('{visit}', 'end')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    guest
        .batch_execute(&format!("DELETE FROM visits WHERE id = '{visit}'"))
        .await
        .unwrap();
    let rows = select(&guest, &format!("SELECT * FROM visits WHERE id = '{visit}'")).await;
    assert_eq!(rows[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn non_ulid_user_is_read_only() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr, "postgres").await;

    let err = client
        .batch_execute(&format!(
            "INSERT INTO restaurants (id, owner_id, name, max_reservation_minutes) VALUES ('{}', '{}', 'X', 60)",
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "28000");

    assert!(select(&client, "SELECT * FROM restaurants").await.is_empty());
}

#[tokio::test]
async fn parse_errors_and_unknown_ids() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr, &Ulid::new().to_string()).await;

    let err = client.batch_execute("SELECT * FROM nowhere").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = client
        .batch_execute(&format!("SELECT * FROM tables WHERE restaurant_id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, engine) = start_test_server().await;
    let owner = Ulid::new();
    let owner_client = connect(addr, &owner.to_string()).await;
    let rid = open_restaurant(&owner_client, owner).await;
    let d = day();

    let guest = Ulid::new();
    let guest_client = connect(addr, &guest.to_string()).await;
    let visit = Ulid::new();
    guest_client
        .execute(
            r#"INSERT INTO reservations (id, restaurant_id, party_size, start, "end") VALUES ($1, $2, $3, $4, $5)"#,
            &[
                &visit.to_string(),
                &rid.to_string(),
                &"4".to_string(),
                &(d + 20 * H).to_string(),
                &(d + 21 * H).to_string(),
            ],
        )
        .await
        .unwrap();

    let info = engine.get_visit(visit).await.unwrap();
    assert_eq!(info.table_id, Some(2));
    assert_eq!(info.creator_id, guest);
}
