//! Database sessions
//!
//! A session is a client workspace: one connection pool, a worker pool
//! gating its streams, a schema manager, and a session-wide cancel token.
//! Opening a session bootstraps the schema, syncs the node registry with the
//! configured nodes, and prints the merged set for operator inspection.

use std::collections::HashMap;
use std::sync::Arc;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{NodeConfig, SessionConfig};
use crate::db::executor::DirectExecutor;
use crate::db::ops::{DbOper, CONNECT_NO_SSL, CONNECT_SSL};
use crate::db::read::{ReadFilter, ReadStream};
use crate::db::schema::SchemaMgr;
use crate::db::types::Node;
use crate::db::write::{WriteKind, WriteStream};
use crate::error::{Error, Result};
use crate::util::WorkerPool;

/// A live client workspace over one database
pub struct Session {
    uuid: String,
    pool: Pool,
    oper: DbOper,
    wp: WorkerPool,
    cancel: CancellationToken,
    schema: SchemaMgr,
}

impl Session {
    /// Open a session described by `conf`, seeding the node registry from
    /// `nodes`. `workers` bounds the number of concurrent streams; zero
    /// falls back to the configured default.
    pub async fn new(
        conf: &SessionConfig,
        nodes: &[NodeConfig],
        id: &str,
        workers: usize,
    ) -> Result<Session> {
        let oper = match conf.type_name.as_str() {
            "postgres" => DbOper::postgres(),
            "cockroachdb" => return Err(Error::not_supported("cockroachdb sessions")),
            other => return Err(Error::config(format!("unknown session type: {}", other))),
        };

        let workers = if workers == 0 { conf.workers } else { workers };
        let constr = connection_string(conf, &oper)?;
        let pg_config: tokio_postgres::Config = constr
            .parse()
            .map_err(|e| Error::config(format!("bad connection parameters: {}", e)))?;

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        // Every write stream pins one connection for its transaction; keep
        // headroom for the schema manager and read queries.
        let pool = Pool::builder(mgr)
            .max_size(workers + 2)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;

        let direct = Arc::new(DirectExecutor::new(pool.clone()));
        let schema = SchemaMgr::start(direct, oper).await?;

        let merged = schema.sync_nodes(nodes.to_vec()).await?;
        print_nodes(&merged);

        info!(session = id, workers, "session opened");
        Ok(Session {
            uuid: id.to_string(),
            pool,
            oper,
            wp: WorkerPool::new(workers),
            cancel: CancellationToken::new(),
            schema,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Open a batched write stream, reserving one worker slot.
    pub async fn open_write_stream(&self, kind: WriteKind) -> Result<WriteStream> {
        self.wp.add().await?;
        match WriteStream::spawn(
            kind,
            &self.pool,
            self.oper,
            self.schema.clone(),
            self.cancel.child_token(),
            self.wp.clone(),
        )
        .await
        {
            Ok(stream) => Ok(stream),
            Err(err) => {
                self.wp.done();
                Err(err)
            }
        }
    }

    /// Open a read stream for the given filter, reserving one worker slot.
    pub async fn open_read_stream(&self, filter: ReadFilter) -> Result<ReadStream> {
        self.wp.add().await?;
        match ReadStream::open(
            filter,
            self.pool.clone(),
            self.oper,
            &self.schema,
            self.cancel.child_token(),
            self.wp.clone(),
        )
        .await
        {
            Ok(stream) => Ok(stream),
            Err(err) => {
                self.wp.done();
                Err(err)
            }
        }
    }

    /// Cancel every live stream, wait for them to drain, and stop the
    /// schema manager.
    pub async fn close(&self) {
        info!(session = %self.uuid, "closing session");
        self.cancel.cancel();
        self.wp.close().await;
        self.schema.stop().await;
    }
}

fn connection_string(conf: &SessionConfig, oper: &DbOper) -> Result<String> {
    let tmpl = if conf.hosts.len() == 1
        && !conf.user.is_empty()
        && !conf.password.is_empty()
        && conf.cert_dir.is_empty()
    {
        oper.getdbop(CONNECT_NO_SSL)
    } else if conf.hosts.len() == 1 && !conf.user.is_empty() && !conf.cert_dir.is_empty() {
        oper.getdbop(CONNECT_SSL)
    } else {
        return Err(Error::config(
            "postgres sessions require a user, a password or cert dir, and exactly one hostname",
        ));
    };

    Ok(tmpl
        .replace("{user}", &conf.user)
        .replace("{password}", &conf.password)
        .replace("{dbname}", &conf.database_name)
        .replace("{host}", &conf.hosts[0]))
}

#[derive(Tabled)]
struct NodeRow {
    name: String,
    ip: String,
    collector: bool,
    #[tabled(rename = "dump minutes")]
    dump_minutes: i32,
    description: String,
}

/// Write the merged node set to stdout for operator inspection.
fn print_nodes(nodes: &HashMap<String, Node>) {
    let mut rows: Vec<NodeRow> = nodes
        .values()
        .map(|n| NodeRow {
            name: n.name.clone(),
            ip: n.ip.clone(),
            collector: n.is_collector,
            dump_minutes: n.dump_duration_minutes,
            description: n.description.clone(),
        })
        .collect();
    rows.sort_by(|a, b| a.ip.cmp(&b.ip));

    println!("merged nodes, from the config file and the db:");
    println!("{}", Table::new(rows).with(Style::sharp()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SessionConfig {
        SessionConfig {
            type_name: "postgres".to_string(),
            user: "bgpmon".to_string(),
            password: "secret".to_string(),
            database_name: "bgpmon".to_string(),
            hosts: vec!["localhost".to_string()],
            cert_dir: String::new(),
            workers: 4,
        }
    }

    #[test]
    fn test_connection_string_no_ssl() {
        let constr = connection_string(&base_config(), &DbOper::postgres()).unwrap();
        assert_eq!(
            constr,
            "user=bgpmon password=secret dbname=bgpmon host=localhost sslmode=disable"
        );
    }

    #[test]
    fn test_connection_string_ssl() {
        let mut conf = base_config();
        conf.cert_dir = "/etc/bgpmond/certs".to_string();
        let constr = connection_string(&conf, &DbOper::postgres()).unwrap();
        assert_eq!(constr, "user=bgpmon password=secret dbname=bgpmon host=localhost");
    }

    #[test]
    fn test_connection_string_rejects_bad_config() {
        let mut conf = base_config();
        conf.password = String::new();
        assert!(matches!(
            connection_string(&conf, &DbOper::postgres()),
            Err(Error::Config(_))
        ));

        let mut conf = base_config();
        conf.hosts = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(
            connection_string(&conf, &DbOper::postgres()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_cockroachdb_not_supported() {
        let mut conf = base_config();
        conf.type_name = "cockroachdb".to_string();
        let res = Session::new(&conf, &[], "test", 1).await;
        assert!(matches!(res, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mut conf = base_config();
        conf.type_name = "mysql".to_string();
        let res = Session::new(&conf, &[], "test", 1).await;
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
