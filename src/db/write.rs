//! Write streams
//!
//! A write stream is a long-running batched ingest pipeline bound to one
//! transaction. All requests funnel through an mpsc channel into a dedicated
//! task, which is the only writer of the per-table insert buffers and the
//! transactional executor.
//!
//! A stream survives two close paths. An owner-initiated close (dropping the
//! request side after `flush`) lets the loop exit cleanly and commit. A
//! session-initiated close fires the cancel token: pending and later `write`
//! callers get `StreamClosed`, and the transaction rolls back.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use deadpool_postgres::Pool;
use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::executor::{SqlExecutor, TxExecutor, CTX_TIMEOUT};
use crate::db::ops::{fill_template, DbOper, INSERT_CAPTURE_TABLE, INSERT_ENTITY_TABLE};
use crate::db::schema::SchemaMgr;
use crate::db::types::{CaptureMessage, Entity, ENTITY_TABLE};
use crate::error::{Error, Result};
use crate::util::{InsertBuffer, SqlParam, WorkerPool};

/// Rows buffered per table before an insert is issued
pub const BUFFER_SIZE: usize = 40;
/// Parameters per buffered capture row
const CAPTURE_PARAMS: usize = 9;
/// Parameters per buffered entity row
const ENTITY_PARAMS: usize = 4;

/// What a write stream accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Capture,
    Entity,
}

/// One write request
#[derive(Debug, Clone)]
pub enum WriteRequest {
    Capture(CaptureMessage),
    Entity(Entity),
}

enum StreamMsg {
    Capture {
        table: String,
        msg: CaptureMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    Entity {
        entity: Entity,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a batched ingest pipeline
pub struct WriteStream {
    kind: WriteKind,
    req: mpsc::Sender<StreamMsg>,
    schema: SchemaMgr,
    task: JoinHandle<()>,
}

impl WriteStream {
    pub(crate) async fn spawn(
        kind: WriteKind,
        pool: &Pool,
        oper: DbOper,
        schema: SchemaMgr,
        cancel: CancellationToken,
        wp: WorkerPool,
    ) -> Result<WriteStream> {
        let ex = Arc::new(TxExecutor::begin(pool, CTX_TIMEOUT).await?);
        let (req_tx, req_rx) = mpsc::channel(1);

        let task = tokio::spawn(run_stream(kind, req_rx, cancel, ex, oper, wp));
        Ok(WriteStream {
            kind,
            req: req_tx,
            schema,
            task,
        })
    }

    /// Submit one record.
    ///
    /// For capture streams the timestamp and collector IP must be present
    /// and well formed; the target table is resolved through the schema
    /// manager before the row is handed to the stream task.
    pub async fn write(&self, request: WriteRequest) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let msg = match (self.kind, request) {
            (WriteKind::Capture, WriteRequest::Capture(msg)) => {
                let (ts, collector) = msg.time_col_ip()?;
                let table = self.schema.get_table(collector, ts).await?;
                StreamMsg::Capture { table, msg, reply }
            }
            (WriteKind::Entity, WriteRequest::Entity(entity)) => {
                StreamMsg::Entity { entity, reply }
            }
            (kind, _) => {
                return Err(Error::programmer(format!(
                    "request does not match {:?} write stream",
                    kind
                )))
            }
        };

        self.req.send(msg).await.map_err(|_| Error::StreamClosed)?;
        rx.await.map_err(|_| Error::StreamClosed)?
    }

    /// Flush every buffer and commit the transaction.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.req
            .send(StreamMsg::Flush { reply })
            .await
            .map_err(|_| Error::StreamClosed)?;
        rx.await.map_err(|_| Error::StreamClosed)?
    }

    /// Record a cancellation so the transaction rolls back instead of
    /// committing.
    pub async fn cancel(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.req
            .send(StreamMsg::Cancel { reply })
            .await
            .map_err(|_| Error::StreamClosed)?;
        rx.await.map_err(|_| Error::StreamClosed)?
    }

    /// Close the stream and join its task. Releases the session worker slot.
    pub async fn close(self) {
        info!("closing write stream");
        drop(self.req);
        if let Err(err) = self.task.await {
            error!(%err, "write stream task panicked");
        }
    }
}

async fn run_stream(
    kind: WriteKind,
    mut req: mpsc::Receiver<StreamMsg>,
    cancel: CancellationToken,
    ex: Arc<TxExecutor>,
    oper: DbOper,
    wp: WorkerPool,
) {
    let mut buffers: HashMap<String, InsertBuffer> = HashMap::new();
    let mut dropped: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Session-initiated close: roll back and report StreamClosed
                // to anyone still waiting on the channel.
                ex.set_error(Error::Cancelled);
                req.close();
                while let Some(msg) = req.recv().await {
                    reply_closed(msg);
                }
                break;
            }
            msg = req.recv() => match msg {
                None => break,
                Some(StreamMsg::Capture { table, msg, reply }) => {
                    let res = add_capture(&mut buffers, &ex, oper, table, msg, &mut dropped).await;
                    if let Err(err) = &res {
                        ex.set_error(err.clone());
                    }
                    let _ = reply.send(res);
                }
                Some(StreamMsg::Entity { entity, reply }) => {
                    let res = add_entity(&mut buffers, &ex, oper, entity).await;
                    if let Err(err) = &res {
                        ex.set_error(err.clone());
                    }
                    let _ = reply.send(res);
                }
                Some(StreamMsg::Flush { reply }) => {
                    let _ = reply.send(flush_all(&mut buffers, &ex).await);
                }
                Some(StreamMsg::Cancel { reply }) => {
                    ex.set_error(Error::Cancelled);
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    if dropped > 0 {
        warn!(kind = ?kind, dropped, "dropped malformed captures");
    }
    // Idempotent: a flushed stream has already committed; an unflushed or
    // cancelled one resolves here (commit or rollback).
    if let Err(err) = ex.done().await {
        error!(%err, "failed to finish write transaction");
    }
    wp.done();
    info!(kind = ?kind, "write stream closed");
}

fn reply_closed(msg: StreamMsg) {
    let reply = match msg {
        StreamMsg::Capture { reply, .. } => reply,
        StreamMsg::Entity { reply, .. } => reply,
        StreamMsg::Flush { reply } => reply,
        StreamMsg::Cancel { reply } => reply,
    };
    let _ = reply.send(Err(Error::StreamClosed));
}

async fn add_capture(
    buffers: &mut HashMap<String, InsertBuffer>,
    ex: &Arc<TxExecutor>,
    oper: DbOper,
    table: String,
    msg: CaptureMessage,
    dropped: &mut u64,
) -> Result<()> {
    // Validated by `write` before the request was enqueued.
    let (ts, collector) = msg.time_col_ip()?;

    // Malformed peer addresses drop the record; a bad next hop degrades to
    // 0.0.0.0.
    let peer: IpAddr = match msg.peer_ip.as_deref().map(|s| s.parse::<IpAddr>()) {
        Some(Ok(ip)) => ip,
        _ => {
            *dropped += 1;
            return Ok(());
        }
    };
    let next_hop: IpAddr = msg
        .next_hop
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let origin = msg.as_path.last().copied().unwrap_or(0);
    let advertised = normalize_prefixes(&msg.advertised);
    let withdrawn = normalize_prefixes(&msg.withdrawn);

    if !buffers.contains_key(&table) {
        info!(table = %table, "creating insert buffer");
        let stmt = fill_template(oper.getdbop(INSERT_CAPTURE_TABLE), &table);
        let ex: Arc<dyn SqlExecutor> = ex.clone();
        buffers.insert(
            table.clone(),
            InsertBuffer::new(ex, stmt, BUFFER_SIZE, CAPTURE_PARAMS, true),
        );
    }
    let buf = buffers.get_mut(&table).expect("buffer just inserted");

    let row: Vec<SqlParam> = vec![
        Box::new(ts.naive_utc()),
        Box::new(collector),
        Box::new(peer),
        Box::new(msg.as_path),
        Box::new(next_hop),
        Box::new(origin),
        Box::new(advertised),
        Box::new(withdrawn),
        Box::new(msg.protomsg),
    ];
    buf.add(row).await
}

async fn add_entity(
    buffers: &mut HashMap<String, InsertBuffer>,
    ex: &Arc<TxExecutor>,
    oper: DbOper,
    entity: Entity,
) -> Result<()> {
    if !buffers.contains_key(ENTITY_TABLE) {
        let stmt = fill_template(oper.getdbop(INSERT_ENTITY_TABLE), ENTITY_TABLE);
        let ex: Arc<dyn SqlExecutor> = ex.clone();
        buffers.insert(
            ENTITY_TABLE.to_string(),
            InsertBuffer::new(ex, stmt, BUFFER_SIZE, ENTITY_PARAMS, false),
        );
    }
    let buf = buffers.get_mut(ENTITY_TABLE).expect("buffer just inserted");

    let prefixes: Vec<String> = entity.owned_prefixes.iter().map(|p| p.to_string()).collect();
    let row: Vec<SqlParam> = vec![
        Box::new(entity.name),
        Box::new(entity.email),
        Box::new(entity.owned_origins),
        Box::new(prefixes),
    ];
    buf.add(row).await
}

async fn flush_all(buffers: &mut HashMap<String, InsertBuffer>, ex: &Arc<TxExecutor>) -> Result<()> {
    for buf in buffers.values_mut() {
        if let Err(err) = buf.flush().await {
            ex.set_error(err.clone());
            return Err(err);
        }
    }
    ex.done().await
}

/// Parse and canonicalize textual prefixes, skipping malformed entries.
fn normalize_prefixes(prefixes: &[String]) -> Vec<String> {
    prefixes
        .iter()
        .filter_map(|p| p.parse::<IpNet>().ok())
        .map(|net| net.trunc().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefixes() {
        let prefixes = vec![
            "10.0.0.0/8".to_string(),
            "10.1.2.3/16".to_string(),
            "garbage".to_string(),
        ];
        let normalized = normalize_prefixes(&prefixes);
        assert_eq!(normalized, vec!["10.0.0.0/8", "10.1.0.0/16"]);
    }
}
