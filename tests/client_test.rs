//! End-to-end client tests against a fake backend process.
#![cfg(unix)]

mod common;

use async_trait::async_trait;
use pg_logstream::proto::{self, Op};
use pg_logstream::{
    Catalog, ChangeOperation, ChangeRecord, Client, ClientConfig, Error, Event, ExtractContext,
    LogPos, NoRetry, Result, Value,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Catalog fixture serving a fixed enum set and a fixed lookup result.
struct StaticCatalog {
    enums: HashSet<i64>,
    row: Option<Vec<Option<String>>>,
}

impl StaticCatalog {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            enums: HashSet::new(),
            row: None,
        })
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn enum_oids(&self) -> Result<HashSet<i64>> {
        Ok(self.enums.clone())
    }

    async fn select_row_text(
        &self,
        _table: &str,
        _key_column: &str,
        _key: i64,
        _columns: &[String],
    ) -> Result<Option<Vec<Option<String>>>> {
        Ok(self.row.clone())
    }
}

/// Catalog whose point lookups always fail.
struct BrokenLookups;

#[async_trait]
impl Catalog for BrokenLookups {
    async fn enum_oids(&self) -> Result<HashSet<i64>> {
        Ok(HashSet::new())
    }

    async fn select_row_text(
        &self,
        _table: &str,
        _key_column: &str,
        _key: i64,
        _columns: &[String],
    ) -> Result<Option<Vec<Option<String>>>> {
        Err(Error::Io(std::io::Error::other("lookup refused")))
    }
}

fn client_config(script: &Path) -> ClientConfig {
    common::init_tracing();
    let mut config = ClientConfig::new(common::db_config(), "test_slot");
    config.program = script.to_path_buf();
    config
}

fn table_of(record: &ChangeRecord, _ctx: &ExtractContext) -> (String, ChangeOperation, LogPos) {
    (record.table.clone(), record.op, record.position)
}

#[tokio::test]
async fn delivers_converted_updates_in_order_then_ends() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = Vec::new();
    for (table, op, pos) in [
        ("alpha", Op::Insert, 0x10u64),
        ("beta", Op::Update, 0x20),
        ("gamma", Op::Delete, 0x30),
    ] {
        data.extend(common::frame_of(&common::row(table, op, pos, vec![])));
    }
    let data = common::write_file(dir.path(), "wal.bin", &data);
    let script = common::write_script(dir.path(), "backend", &format!("cat {}", data.display()));

    let (client, mut updates, mut events) = Client::connect_with_policy(
        client_config(&script),
        StaticCatalog::empty(),
        table_of,
        LogPos::ZERO,
        NoRetry,
    )
    .await
    .unwrap();

    for (table, op, pos) in [
        ("alpha", ChangeOperation::Insert, 0x10u64),
        ("beta", ChangeOperation::Update, 0x20),
        ("gamma", ChangeOperation::Delete, 0x30),
    ] {
        let (got_table, got_op, got_pos) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(got_table, table);
        assert_eq!(got_op, op);
        assert_eq!(got_pos, LogPos::new(pos));
    }

    // Clean backend exit plus a no-retry policy: both feeds end.
    assert!(timeout(WAIT, updates.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    assert_eq!(client.position(), LogPos::new(0x30));
}

#[tokio::test]
async fn reconnects_from_the_last_accepted_position() {
    let dir = tempfile::tempdir().unwrap();
    let first = common::write_file(
        dir.path(),
        "first.bin",
        &[
            common::frame_of(&common::row("alpha", Op::Insert, 0x10, vec![])),
            common::frame_of(&common::row("beta", Op::Insert, 0x20, vec![])),
        ]
        .concat(),
    );
    let second = common::write_file(
        dir.path(),
        "second.bin",
        &common::frame_of(&common::row("gamma", Op::Insert, 0x30, vec![])),
    );
    let mark = dir.path().join("mark");
    let args = dir.path().join("args.txt");
    // First invocation streams two records and dies; the second records its
    // arguments, streams one more, and lingers until interrupted.
    let script = common::write_script(
        dir.path(),
        "backend",
        &format!(
            "if [ ! -f {mark} ]; then\n  touch {mark}\n  cat {first}\n  exit 1\nfi\necho \"$@\" > {args}\ncat {second}\n{linger}",
            mark = mark.display(),
            first = first.display(),
            args = args.display(),
            second = second.display(),
            linger = common::LINGER,
        ),
    );

    let (client, mut updates, mut events) = Client::connect(
        client_config(&script),
        StaticCatalog::empty(),
        table_of,
        LogPos::ZERO,
    )
    .await
    .unwrap();

    for table in ["alpha", "beta"] {
        let (got, _, _) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(got, table);
    }

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(
        matches!(event, Event::BackendExitFault(Error::BackendExit { .. })),
        "got {event:?}"
    );
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, Event::Reconnected), "got {event:?}");

    let (got, _, pos) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(got, "gamma");
    assert_eq!(pos, LogPos::new(0x30));
    assert_eq!(client.position(), LogPos::new(0x30));

    // The replacement stream picks up where the first left off.
    let recorded = fs::read_to_string(&args).unwrap();
    assert!(
        recorded.contains("--startpos=0/20"),
        "args were: {recorded}"
    );

    timeout(WAIT, client.close()).await.unwrap();
    assert!(updates.recv().await.is_none());
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn close_stops_a_live_stream_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(dir.path(), "backend", common::LINGER);

    let (client, mut updates, mut events) = Client::connect(
        client_config(&script),
        StaticCatalog::empty(),
        table_of,
        LogPos::ZERO,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(WAIT, client.close()).await.unwrap();

    // An interrupted backend is a requested stop, not a fault.
    assert!(updates.recv().await.is_none());
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn close_suppresses_the_interrupted_backend_fault() {
    let dir = tempfile::tempdir().unwrap();
    // A backend that dies non-zero when interrupted, as `sleep` under
    // SIGINT does.
    let script = common::write_script(
        dir.path(),
        "backend",
        "trap 'kill $!; exit 3' INT\nsleep 30 &\nwait $!",
    );

    let (client, mut updates, mut events) = Client::connect(
        client_config(&script),
        StaticCatalog::empty(),
        table_of,
        LogPos::ZERO,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(WAIT, client.close()).await.unwrap();

    assert!(updates.recv().await.is_none());
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn connect_fails_synchronously_for_a_missing_backend() {
    let config = client_config(Path::new("/nonexistent/pg_recvlogical"));
    let result =
        Client::connect(config, StaticCatalog::empty(), table_of, LogPos::ZERO).await;
    assert!(matches!(result, Err(Error::Io(_))));
}

fn unchanged_row() -> proto::RowMessage {
    common::row(
        "posts",
        Op::Update,
        0x40,
        vec![
            common::int_datum("id", 5),
            proto::DatumMessage {
                column_name: Some("body".to_string()),
                column_type: Some(25),
                datum: Some(proto::Datum::UnchangedNoValue(true)),
            },
        ],
    )
}

fn body_of(record: &ChangeRecord, ctx: &ExtractContext) -> Option<Value> {
    record
        .new_tuple
        .iter()
        .find(|d| d.column == "body")
        .and_then(|d| ctx.extract(d).ok().flatten())
}

#[tokio::test]
async fn backfills_unchanged_columns_before_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let data = common::write_file(dir.path(), "wal.bin", &common::frame_of(&unchanged_row()));
    let script = common::write_script(dir.path(), "backend", &format!("cat {}", data.display()));

    let catalog = Arc::new(StaticCatalog {
        enums: HashSet::new(),
        row: Some(vec![Some("filled in".to_string())]),
    });
    let mut config = client_config(&script);
    config.backfill = true;

    let (_client, mut updates, _events) =
        Client::connect_with_policy(config, catalog, body_of, LogPos::ZERO, NoRetry)
            .await
            .unwrap();

    let body = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(body, Some(Value::String("filled in".to_string())));
}

#[tokio::test]
async fn backfill_fault_is_scoped_to_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let data = common::write_file(dir.path(), "wal.bin", &common::frame_of(&unchanged_row()));
    let script = common::write_script(dir.path(), "backend", &format!("cat {}", data.display()));

    let mut config = client_config(&script);
    config.backfill = true;

    let (_client, mut updates, mut events) = Client::connect_with_policy(
        config,
        Arc::new(BrokenLookups),
        body_of,
        LogPos::ZERO,
        NoRetry,
    )
    .await
    .unwrap();

    // The record is still delivered, with the unchanged value absent.
    let body = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(body, None);

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(
        matches!(event, Event::BackfillFault { ref table, .. } if table == "posts"),
        "got {event:?}"
    );
}

#[tokio::test]
async fn republishes_backend_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(
        dir.path(),
        "backend",
        &format!("echo 'streaming started' >&2\n{}", common::LINGER),
    );

    let (client, _updates, mut events) = Client::connect(
        client_config(&script),
        StaticCatalog::empty(),
        table_of,
        LogPos::ZERO,
    )
    .await
    .unwrap();

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(
        matches!(event, Event::StderrLine(ref line) if line == "streaming started"),
        "got {event:?}"
    );
    timeout(WAIT, client.close()).await.unwrap();
}
