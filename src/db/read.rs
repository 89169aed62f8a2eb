//! Read streams
//!
//! A read stream is a lazy cursor over typed records. Capture streams span
//! every capture table whose catalog window intersects the requested range,
//! visiting them in increasing `dateFrom` order; entity streams scan the
//! fixed entity table. Rows arrive one at a time over the driver's row
//! stream, so a large range never materializes in memory.
//!
//! Iterator contract: `read` advances the cursor, `data` returns the current
//! record, `err` the terminal error (`None` on clean end-of-stream), and
//! `close` releases resources and is idempotent.

use std::net::IpAddr;
use std::pin::Pin;

use chrono::{DateTime, TimeZone, Utc};
use deadpool_postgres::{Object, Pool};
use futures::StreamExt;
use ipnet::IpNet;
use tokio::time::timeout;
use tokio_postgres::types::ToSql;
use tokio_postgres::RowStream;
use tokio_util::sync::CancellationToken;

use crate::db::executor::CTX_TIMEOUT;
use crate::db::ops::{fill_template, DbOper, SELECT_CAPTURE_TABLE, SELECT_ENTITY};
use crate::db::schema::SchemaMgr;
use crate::db::types::{Capture, CollectorTable, Entity, ENTITY_TABLE};
use crate::error::{Error, Result};
use crate::util::WorkerPool;

/// Filter for a capture read: a collector (or any), a half-open time range,
/// and optionally a set of subnets the advertised prefixes must fall within.
#[derive(Debug, Clone)]
pub struct CaptureFilter {
    /// `None` scans every collector
    pub collector: Option<IpAddr>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub allow_subnets: Vec<IpNet>,
}

impl CaptureFilter {
    pub fn new(collector: Option<IpAddr>, start: DateTime<Utc>, end: DateTime<Utc>) -> CaptureFilter {
        CaptureFilter {
            collector,
            start,
            end,
            allow_subnets: Vec::new(),
        }
    }

    /// Restrict the scan to captures advertising a prefix contained by one
    /// of the given subnets.
    pub fn allow_subnets(mut self, subnets: Vec<IpNet>) -> CaptureFilter {
        self.allow_subnets = subnets;
        self
    }
}

/// Filter for an entity read; an unset name scans every entity
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub name: Option<String>,
}

/// Filter variants accepted by `open_read_stream`
#[derive(Debug, Clone)]
pub enum ReadFilter {
    Capture(CaptureFilter),
    Entity(EntityFilter),
}

/// A record yielded by a read stream
#[derive(Debug, Clone)]
pub enum Record {
    Capture(Capture),
    Entity(Entity),
}

/// Lazy cursor over captures or entities
pub struct ReadStream {
    inner: Reader,
    cancel: CancellationToken,
    wp: WorkerPool,
    cur: Option<Record>,
    err: Option<Error>,
    closed: bool,
}

impl ReadStream {
    pub(crate) async fn open(
        filter: ReadFilter,
        pool: Pool,
        oper: DbOper,
        schema: &SchemaMgr,
        cancel: CancellationToken,
        wp: WorkerPool,
    ) -> Result<ReadStream> {
        let inner = match filter {
            ReadFilter::Capture(filter) => {
                let tables = schema
                    .get_tables(filter.collector, filter.start, filter.end)
                    .await?;
                Reader::Capture(CaptureReader {
                    pool,
                    oper,
                    filter,
                    tables,
                    next_table: 0,
                    active: None,
                })
            }
            ReadFilter::Entity(filter) => Reader::Entity(EntityReader {
                pool,
                oper,
                filter,
                active: None,
                finished: false,
            }),
        };

        Ok(ReadStream {
            inner,
            cancel,
            wp,
            cur: None,
            err: None,
            closed: false,
        })
    }

    /// Advance the cursor. Returns false on end-of-stream or error; check
    /// `err` to tell the two apart.
    pub async fn read(&mut self) -> bool {
        if self.closed || self.err.is_some() {
            return false;
        }

        let advanced = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            next = self.inner.next() => next,
        };

        match advanced {
            Ok(Some(record)) => {
                self.cur = Some(record);
                true
            }
            Ok(None) => {
                self.cur = None;
                false
            }
            Err(err) => {
                self.cur = None;
                self.err = Some(err);
                false
            }
        }
    }

    /// The record the cursor is currently on
    pub fn data(&self) -> Option<Record> {
        self.cur.clone()
    }

    /// Terminal error, if the stream ended on one
    pub fn err(&self) -> Option<Error> {
        self.err.clone()
    }

    /// Release the cursor and the session worker slot. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inner.release();
        self.wp.done();
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.close();
    }
}

enum Reader {
    Capture(CaptureReader),
    Entity(EntityReader),
}

impl Reader {
    async fn next(&mut self) -> Result<Option<Record>> {
        match self {
            Reader::Capture(r) => r.next().await,
            Reader::Entity(r) => r.next().await,
        }
    }

    fn release(&mut self) {
        match self {
            Reader::Capture(r) => r.active = None,
            Reader::Entity(r) => r.active = None,
        }
    }
}

/// A checked-out connection with a row stream running on it
struct ActiveQuery {
    rows: Pin<Box<RowStream>>,
    // Held so the connection outlives the row stream.
    _conn: Object,
}

struct CaptureReader {
    pool: Pool,
    oper: DbOper,
    filter: CaptureFilter,
    tables: Vec<CollectorTable>,
    next_table: usize,
    active: Option<ActiveQuery>,
}

impl CaptureReader {
    async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if self.active.is_none() {
                let Some(table) = self.tables.get(self.next_table) else {
                    return Ok(None);
                };
                let name = table.name.clone();
                self.next_table += 1;
                self.active = Some(self.open_table(&name).await?);
            }

            let active = self.active.as_mut().expect("capture query just opened");
            match active.rows.as_mut().next().await {
                Some(Ok(row)) => return Ok(Some(Record::Capture(capture_from_row(&row)?))),
                Some(Err(err)) => return Err(err.into()),
                // This table is exhausted; move on to the next one.
                None => self.active = None,
            }
        }
    }

    async fn open_table(&self, table: &str) -> Result<ActiveQuery> {
        let conn = timeout(CTX_TIMEOUT, self.pool.get())
            .await
            .map_err(|_| Error::Timeout)??;

        let mut stmt = fill_template(self.oper.getdbop(SELECT_CAPTURE_TABLE), table);
        let start = self.filter.start.naive_utc();
        let end = self.filter.end.naive_utc();
        let subnets: Vec<String> = self
            .filter
            .allow_subnets
            .iter()
            .map(|net| net.to_string())
            .collect();

        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&start, &end];
        if !subnets.is_empty() {
            stmt.push_str(
                " AND EXISTS (SELECT 1 FROM unnest(adv_prefixes) pfx \
                 WHERE pfx::cidr <<= ANY($3::text[]::cidr[]))",
            );
            params.push(&subnets);
        }
        stmt.push_str(" ORDER BY timestamp;");

        let rows = timeout(CTX_TIMEOUT, conn.query_raw(stmt.as_str(), params))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(ActiveQuery {
            rows: Box::pin(rows),
            _conn: conn,
        })
    }
}

struct EntityReader {
    pool: Pool,
    oper: DbOper,
    filter: EntityFilter,
    active: Option<ActiveQuery>,
    finished: bool,
}

impl EntityReader {
    async fn next(&mut self) -> Result<Option<Record>> {
        if self.active.is_none() {
            if self.finished {
                return Ok(None);
            }
            self.active = Some(self.open_query().await?);
        }

        let active = self.active.as_mut().expect("entity query just opened");
        match active.rows.as_mut().next().await {
            Some(Ok(row)) => Ok(Some(Record::Entity(entity_from_row(&row)?))),
            Some(Err(err)) => Err(err.into()),
            None => {
                self.active = None;
                self.finished = true;
                Ok(None)
            }
        }
    }

    async fn open_query(&self) -> Result<ActiveQuery> {
        let conn = timeout(CTX_TIMEOUT, self.pool.get())
            .await
            .map_err(|_| Error::Timeout)??;

        let mut stmt = fill_template(self.oper.getdbop(SELECT_ENTITY), ENTITY_TABLE);
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(name) = &self.filter.name {
            stmt.push_str(" WHERE name = $1");
            params.push(name);
        }
        stmt.push(';');

        let rows = timeout(CTX_TIMEOUT, conn.query_raw(stmt.as_str(), params))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(ActiveQuery {
            rows: Box::pin(rows),
            _conn: conn,
        })
    }
}

fn capture_from_row(row: &tokio_postgres::Row) -> Result<Capture> {
    let timestamp: chrono::NaiveDateTime = row.try_get(1)?;
    Ok(Capture {
        update_id: row.try_get(0)?,
        timestamp: Utc.from_utc_datetime(&timestamp),
        collector_ip: row.try_get(2)?,
        peer_ip: row.try_get(3)?,
        as_path: row.try_get(4)?,
        next_hop: row.try_get(5)?,
        origin_as: row.try_get(6)?,
        advertised: parse_prefixes(row.try_get(7)?)?,
        withdrawn: parse_prefixes(row.try_get(8)?)?,
        protomsg: row.try_get(9)?,
    })
}

fn entity_from_row(row: &tokio_postgres::Row) -> Result<Entity> {
    Ok(Entity {
        name: row.try_get(0)?,
        email: row.try_get::<_, Option<String>>(1)?.unwrap_or_default(),
        owned_origins: row.try_get::<_, Option<Vec<i32>>>(2)?.unwrap_or_default(),
        owned_prefixes: parse_prefixes(
            row.try_get::<_, Option<Vec<String>>>(3)?.unwrap_or_default(),
        )?,
    })
}

fn parse_prefixes(prefixes: Vec<String>) -> Result<Vec<IpNet>> {
    prefixes
        .into_iter()
        .map(|p| {
            p.parse::<IpNet>()
                .map_err(|_| Error::parse(format!("malformed stored prefix: {}", p)))
        })
        .collect()
}
