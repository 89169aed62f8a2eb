//! Schema manager
//!
//! A single-owner actor that serves table discovery and creation over a
//! request/reply channel pair. All mutable state — the node registry map and
//! the positive cache of known catalog windows — is confined to the actor
//! task; the rest of the crate talks to it through [`SchemaMgr`] handles.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::db::executor::SqlExecutor;
use crate::db::ops::{
    fill_template, DbOper, CHECK_SCHEMA, INSERT_MAIN_TABLE, INSERT_NODE, MAKE_CAPTURE_TABLE,
    MAKE_ENTITY_TABLE, MAKE_MAIN_TABLE, MAKE_NODE_TABLE, SELECT_NODE, SELECT_TABLE,
    SELECT_TABLE_RANGE,
};
use crate::db::types::{
    capture_table_name, capture_window, CollectorTable, Node, ENTITY_TABLE, MAIN_TABLE, NODE_TABLE,
};
use crate::error::{Error, Result};

enum SchemaRequest {
    GetTable {
        collector: IpAddr,
        ts: DateTime<Utc>,
        reply: oneshot::Sender<Result<String>>,
    },
    GetTables {
        collector: Option<IpAddr>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reply: oneshot::Sender<Result<Vec<CollectorTable>>>,
    },
    SyncNodes {
        nodes: Vec<NodeConfig>,
        reply: oneshot::Sender<Result<HashMap<String, Node>>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the schema manager actor
#[derive(Clone)]
pub struct SchemaMgr {
    req: mpsc::Sender<SchemaRequest>,
}

impl SchemaMgr {
    /// Bootstrap the schema (node registry, main catalog, entity table) and
    /// start the actor task.
    pub async fn start(ex: Arc<dyn SqlExecutor>, oper: DbOper) -> Result<SchemaMgr> {
        let mut task = SchemaTask {
            ex,
            oper,
            nodes: HashMap::new(),
            cache: HashMap::new(),
        };
        task.make_schema().await?;

        let (req_tx, req_rx) = mpsc::channel(16);
        tokio::spawn(task.run(req_rx));
        Ok(SchemaMgr { req: req_tx })
    }

    /// Resolve the capture table for a `(collector, timestamp)` pair,
    /// creating the table and its catalog row if this is the first capture
    /// in the window.
    pub async fn get_table(&self, collector: IpAddr, ts: DateTime<Utc>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.req
            .send(SchemaRequest::GetTable {
                collector,
                ts,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Return the catalog rows whose window intersects `[start, end)`,
    /// in increasing `dateFrom` order, optionally filtered by collector.
    /// Purely a read: no side effects, no caching.
    pub async fn get_tables(
        &self,
        collector: Option<IpAddr>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CollectorTable>> {
        let (reply, rx) = oneshot::channel();
        self.req
            .send(SchemaRequest::GetTables {
                collector,
                start,
                end,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Merge the configured nodes with the node registry and write the
    /// merged set back. Returns the merged map keyed by IP.
    pub async fn sync_nodes(&self, nodes: Vec<NodeConfig>) -> Result<HashMap<String, Node>> {
        let (reply, rx) = oneshot::channel();
        self.req
            .send(SchemaRequest::SyncNodes { nodes, reply })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Drain in-flight requests and stop the actor.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .req
            .send(SchemaRequest::Stop { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct CachedWindow {
    name: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

struct SchemaTask {
    ex: Arc<dyn SqlExecutor>,
    oper: DbOper,
    /// Node registry as of the last sync, keyed by IP
    nodes: HashMap<String, Node>,
    /// Positive cache of discovered catalog windows, keyed by collector IP.
    /// Windows are immutable once created, so entries never invalidate.
    cache: HashMap<String, Vec<CachedWindow>>,
}

impl SchemaTask {
    async fn run(mut self, mut req: mpsc::Receiver<SchemaRequest>) {
        while let Some(msg) = req.recv().await {
            match msg {
                SchemaRequest::GetTable {
                    collector,
                    ts,
                    reply,
                } => {
                    let _ = reply.send(self.get_table(collector, ts).await);
                }
                SchemaRequest::GetTables {
                    collector,
                    start,
                    end,
                    reply,
                } => {
                    let _ = reply.send(self.get_tables(collector, start, end).await);
                }
                SchemaRequest::SyncNodes { nodes, reply } => {
                    let _ = reply.send(self.sync_nodes(nodes).await);
                }
                SchemaRequest::Stop { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("schema manager stopped");
    }

    /// Idempotent create of the node registry, main catalog, and entity
    /// tables.
    async fn make_schema(&mut self) -> Result<()> {
        for (table, make_op) in [
            (NODE_TABLE, MAKE_NODE_TABLE),
            (MAIN_TABLE, MAKE_MAIN_TABLE),
            (ENTITY_TABLE, MAKE_ENTITY_TABLE),
        ] {
            let row = self
                .ex
                .query_row(self.oper.getdbop(CHECK_SCHEMA), &[&table])
                .await?;
            let exists: bool = row.try_get(0)?;
            if !exists {
                info!(table, "creating schema table");
                self.ex
                    .exec(&fill_template(self.oper.getdbop(make_op), table), &[])
                    .await?;
            }
        }
        Ok(())
    }

    async fn get_table(&mut self, collector: IpAddr, ts: DateTime<Utc>) -> Result<String> {
        let col = collector.to_string();

        if let Some(windows) = self.cache.get(&col) {
            if let Some(hit) = windows.iter().find(|w| w.start <= ts && ts < w.end) {
                return Ok(hit.name.clone());
            }
        }

        // Not cached; ask the catalog.
        let stmt = fill_template(self.oper.getdbop(SELECT_TABLE), MAIN_TABLE);
        let rows = self.ex.query(&stmt, &[&col, &ts.naive_utc()]).await?;
        if let Some(row) = rows.first() {
            let table = collector_table_from_row(row)?;
            let name = table.name.clone();
            self.remember(&col, table);
            return Ok(name);
        }

        // First capture in this window: create the table and register it.
        let node = self
            .nodes
            .get(&col)
            .ok_or_else(|| Error::not_found(format!("collector {} in node registry", col)))?;
        if !node.is_collector || node.dump_duration_minutes <= 0 {
            return Err(Error::config(format!(
                "node {} is not a collector with a dump duration",
                col
            )));
        }

        let (start, end) = capture_window(ts, node.dump_duration_minutes);
        let name = capture_table_name(&collector, start);

        self.ex
            .exec(
                &fill_template(self.oper.getdbop(MAKE_CAPTURE_TABLE), &name),
                &[],
            )
            .await?;

        let insert = fill_template(self.oper.getdbop(INSERT_MAIN_TABLE), MAIN_TABLE);
        match self
            .ex
            .exec(
                &insert,
                &[&name, &col, &start.naive_utc(), &end.naive_utc()],
            )
            .await
        {
            Ok(_) => {
                info!(table = %name, collector = %col, "registered capture table");
            }
            // Lost a creation race: the catalog row is keyed by table name,
            // so the window already converged on this same name.
            Err(err) if err.is_unique_violation() => {
                debug!(table = %name, "capture table registered concurrently");
            }
            Err(err) => return Err(err),
        }

        self.remember(
            &col,
            CollectorTable {
                name: name.clone(),
                collector: col.clone(),
                date_from: start,
                date_to: end,
            },
        );
        Ok(name)
    }

    fn remember(&mut self, collector: &str, table: CollectorTable) {
        self.cache
            .entry(collector.to_string())
            .or_default()
            .push(CachedWindow {
                name: table.name,
                start: table.date_from,
                end: table.date_to,
            });
    }

    async fn get_tables(
        &mut self,
        collector: Option<IpAddr>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CollectorTable>> {
        let mut stmt = fill_template(self.oper.getdbop(SELECT_TABLE_RANGE), MAIN_TABLE);
        let start = start.naive_utc();
        let end = end.naive_utc();
        let col = collector.map(|c| c.to_string());

        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&start, &end];
        if let Some(col) = &col {
            stmt.push_str(" AND collector = $3");
            params.push(col);
        }
        stmt.push_str(" ORDER BY dateFrom;");

        let rows = self.ex.query(&stmt, &params).await?;
        rows.iter().map(collector_table_from_row).collect()
    }

    async fn sync_nodes(&mut self, config_nodes: Vec<NodeConfig>) -> Result<HashMap<String, Node>> {
        let stmt = fill_template(self.oper.getdbop(SELECT_NODE), NODE_TABLE);
        let rows = self.ex.query(&stmt, &[]).await?;

        let mut merged: HashMap<String, Node> = HashMap::new();
        for row in &rows {
            let node = node_from_row(row)?;
            merged.insert(node.ip.clone(), node);
        }

        // Config wins on every non-key field; registry-only rows survive.
        for cfg in config_nodes {
            merged.insert(
                cfg.ip.clone(),
                Node {
                    name: cfg.name,
                    ip: cfg.ip,
                    is_collector: cfg.is_collector,
                    dump_duration_minutes: cfg.dump_duration_minutes,
                    description: cfg.description,
                    coords: cfg.coords,
                    address: cfg.location,
                },
            );
        }

        let upsert = fill_template(self.oper.getdbop(INSERT_NODE), NODE_TABLE);
        for node in merged.values() {
            self.ex
                .exec(
                    &upsert,
                    &[
                        &node.name,
                        &node.ip,
                        &node.is_collector,
                        &node.dump_duration_minutes,
                        &node.description,
                        &node.coords,
                        &node.address,
                    ],
                )
                .await?;
        }

        self.nodes = merged.clone();
        Ok(merged)
    }
}

fn node_from_row(row: &tokio_postgres::Row) -> Result<Node> {
    Ok(Node {
        name: row.try_get::<_, Option<String>>(0)?.unwrap_or_default(),
        ip: row.try_get(1)?,
        is_collector: row.try_get::<_, Option<bool>>(2)?.unwrap_or_default(),
        dump_duration_minutes: row.try_get::<_, Option<i32>>(3)?.unwrap_or_default(),
        description: row.try_get::<_, Option<String>>(4)?.unwrap_or_default(),
        coords: row.try_get::<_, Option<String>>(5)?.unwrap_or_default(),
        address: row.try_get::<_, Option<String>>(6)?.unwrap_or_default(),
    })
}

fn collector_table_from_row(row: &tokio_postgres::Row) -> Result<CollectorTable> {
    let date_from: chrono::NaiveDateTime = row.try_get(2)?;
    let date_to: chrono::NaiveDateTime = row.try_get(3)?;
    Ok(CollectorTable {
        name: row.try_get(0)?,
        collector: row.try_get(1)?,
        date_from: Utc.from_utc_datetime(&date_from),
        date_to: Utc.from_utc_datetime(&date_to),
    })
}
