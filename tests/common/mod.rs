//! Shared helpers for the integration tests: a fake backend in place of
//! `pg_recvlogical`, and builders for its framed wire output.
#![allow(dead_code)]

use pg_logstream::proto;
use pg_logstream::DatabaseConfig;
use prost::Message as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Routes library tracing to the test output, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn db_config() -> DatabaseConfig {
    DatabaseConfig::new("app")
}

pub fn text_datum(column: &str, value: &str) -> proto::DatumMessage {
    proto::DatumMessage {
        column_name: Some(column.to_string()),
        column_type: Some(25),
        datum: Some(proto::Datum::String(value.to_string())),
    }
}

pub fn int_datum(column: &str, value: i32) -> proto::DatumMessage {
    proto::DatumMessage {
        column_name: Some(column.to_string()),
        column_type: Some(23),
        datum: Some(proto::Datum::Int32(value)),
    }
}

pub fn row(
    table: &str,
    op: proto::Op,
    position: u64,
    new_tuple: Vec<proto::DatumMessage>,
) -> proto::RowMessage {
    proto::RowMessage {
        transaction_id: Some(1),
        commit_time: Some(1_700_000_000_000_000),
        table: Some(table.to_string()),
        op: Some(op as i32),
        new_tuple,
        old_tuple: Vec::new(),
        log_position: Some(position),
    }
}

/// Wraps a payload in the backend's frame format: big-endian length, one
/// marker byte, then the payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.push(b'd');
    out.extend_from_slice(payload);
    out
}

pub fn frame_of(row: &proto::RowMessage) -> Vec<u8> {
    frame(&row.encode_to_vec())
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

/// Writes an executable shell script standing in for `pg_recvlogical`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Script fragment that lingers until interrupted and then exits cleanly,
/// the way `pg_recvlogical` responds to SIGINT. Kills its timer so no
/// grandchild outlives the script holding the pipes.
pub const LINGER: &str = "trap 'kill $!; exit 0' INT\nsleep 30 &\nwait $!";
