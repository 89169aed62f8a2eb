//! Record types and table-name arithmetic
//!
//! The persisted layout:
//! - `nodes`: one row per BGP observation point, keyed by IP
//! - `dbs`: the main catalog mapping capture-table names to their collector
//!   and `[dateFrom, dateTo)` window
//! - `entities`: named owners of origin ASes and prefixes
//! - per-collector capture tables named `<sanitized-ip>_<window-start>`

use std::net::IpAddr;

use chrono::{DateTime, TimeZone, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the node-registry table
pub const NODE_TABLE: &str = "nodes";
/// Name of the main catalog table
pub const MAIN_TABLE: &str = "dbs";
/// Name of the entity table
pub const ENTITY_TABLE: &str = "entities";

/// A BGP observation point, as stored in the node registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub ip: String,
    pub is_collector: bool,
    pub dump_duration_minutes: i32,
    pub description: String,
    pub coords: String,
    pub address: String,
}

/// One main-catalog row: a capture table and the window it covers
#[derive(Debug, Clone)]
pub struct CollectorTable {
    pub name: String,
    pub collector: String,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

/// One stored BGP update
#[derive(Debug, Clone)]
pub struct Capture {
    pub update_id: String,
    pub timestamp: DateTime<Utc>,
    pub collector_ip: IpAddr,
    pub peer_ip: IpAddr,
    pub as_path: Vec<i32>,
    pub next_hop: IpAddr,
    pub origin_as: i32,
    pub advertised: Vec<IpNet>,
    pub withdrawn: Vec<IpNet>,
    pub protomsg: Vec<u8>,
}

/// An ingest request for one BGP update, as received from a client.
///
/// Timestamp and collector IP are required; the rest follows the
/// drop-with-count policy of the write stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureMessage {
    pub timestamp: Option<DateTime<Utc>>,
    pub collector_ip: Option<String>,
    pub peer_ip: Option<String>,
    #[serde(default)]
    pub as_path: Vec<i32>,
    pub next_hop: Option<String>,
    #[serde(default)]
    pub advertised: Vec<String>,
    #[serde(default)]
    pub withdrawn: Vec<String>,
    #[serde(default)]
    pub protomsg: Vec<u8>,
}

impl CaptureMessage {
    /// Extract the timestamp and collector IP, failing with a parse error if
    /// either is missing or malformed.
    pub fn time_col_ip(&self) -> Result<(DateTime<Utc>, IpAddr)> {
        let ts = self
            .timestamp
            .ok_or_else(|| Error::parse("capture has no timestamp"))?;
        let col = self
            .collector_ip
            .as_deref()
            .ok_or_else(|| Error::parse("capture has no collector IP"))?;
        let col: IpAddr = col
            .parse()
            .map_err(|_| Error::parse(format!("malformed collector IP: {}", col)))?;
        Ok((ts, col))
    }
}

/// A named owner of origin ASes and prefixes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub owned_origins: Vec<i32>,
    #[serde(default)]
    pub owned_prefixes: Vec<IpNet>,
}

/// Sanitize an IP for use inside a table identifier
pub fn sanitize_ip(ip: &IpAddr) -> String {
    ip.to_string().replace(['.', ':'], "_")
}

/// The dump window covering `ts` for a collector with the given dump
/// duration: `[start, start + duration)` with `start` aligned down to a
/// multiple of the duration.
pub fn capture_window(ts: DateTime<Utc>, dump_duration_minutes: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    let span = i64::from(dump_duration_minutes) * 60;
    let start = ts.timestamp().div_euclid(span) * span;
    (
        Utc.timestamp_opt(start, 0).unwrap(),
        Utc.timestamp_opt(start + span, 0).unwrap(),
    )
}

/// Name of the capture table for one collector window
pub fn capture_table_name(collector: &IpAddr, window_start: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        sanitize_ip(collector),
        window_start.format("%Y%m%d%H%M")
    )
}
