//! Operation dictionary
//!
//! Compile-time table of SQL templates keyed by logical operation name and
//! indexed by dialect. Table names are substituted with `fill_template`;
//! value placeholders are positional (`$1`, `$2`, ...). Looking up an op that
//! does not exist, or one with no template for the active dialect, is a
//! programming error and panics.

use std::collections::HashMap;
use std::sync::LazyLock;

pub const CONNECT_NO_SSL: &str = "connectNoSSL";
pub const CONNECT_SSL: &str = "connectSSL";
pub const CHECK_SCHEMA: &str = "checkschema";
pub const SELECT_NODE: &str = "selectNodeTmpl";
pub const INSERT_NODE: &str = "insertNodeTmpl";
pub const INSERT_MAIN_TABLE: &str = "insertMainTableTmpl";
pub const MAKE_MAIN_TABLE: &str = "makeMainTableTmpl";
pub const SELECT_TABLE: &str = "selectTableTmpl";
pub const SELECT_TABLE_RANGE: &str = "selectTableRangeTmpl";
pub const MAKE_NODE_TABLE: &str = "makeNodeTableTmpl";
pub const MAKE_CAPTURE_TABLE: &str = "makeCaptureTableTmpl";
pub const INSERT_CAPTURE_TABLE: &str = "insertCaptureTableTmpl";
pub const SELECT_CAPTURE_TABLE: &str = "selectCaptureTableTmpl";
pub const MAKE_ENTITY_TABLE: &str = "makeEntityTableTmpl";
pub const INSERT_ENTITY_TABLE: &str = "insertEntityTableTmpl";
pub const SELECT_ENTITY: &str = "selectEntityTmpl";

/// SQL dialect tag. PostgreSQL is currently the only dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
}

impl SqlDialect {
    fn index(self) -> usize {
        match self {
            SqlDialect::Postgres => 0,
        }
    }
}

static DBOPS: LazyLock<HashMap<&'static str, Vec<&'static str>>> = LazyLock::new(|| {
    let mut ops: HashMap<&'static str, Vec<&'static str>> = HashMap::new();

    ops.insert(
        CONNECT_NO_SSL,
        vec!["user={user} password={password} dbname={dbname} host={host} sslmode=disable"],
    );
    ops.insert(
        CONNECT_SSL,
        vec!["user={user} password={password} dbname={dbname} host={host}"],
    );
    ops.insert(
        CHECK_SCHEMA,
        vec!["SELECT EXISTS (SELECT * FROM information_schema.tables WHERE table_name = $1);"],
    );
    ops.insert(
        SELECT_NODE,
        vec![
            "SELECT name, ip, isCollector, tableDumpDurationMinutes, description, coords, address \
             FROM {table};",
        ],
    );
    ops.insert(
        INSERT_NODE,
        vec![
            "INSERT INTO {table} \
             (name, ip, isCollector, tableDumpDurationMinutes, description, coords, address) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (ip) DO UPDATE SET name=EXCLUDED.name, isCollector=EXCLUDED.isCollector, \
             tableDumpDurationMinutes=EXCLUDED.tableDumpDurationMinutes, \
             description=EXCLUDED.description, coords=EXCLUDED.coords, address=EXCLUDED.address;",
        ],
    );
    ops.insert(
        MAKE_MAIN_TABLE,
        vec![
            "CREATE TABLE IF NOT EXISTS {table} (\
             dbname varchar PRIMARY KEY, \
             collector varchar, \
             dateFrom timestamp, \
             dateTo timestamp);",
        ],
    );
    ops.insert(
        INSERT_MAIN_TABLE,
        vec!["INSERT INTO {table} (dbname, collector, dateFrom, dateTo) VALUES ($1, $2, $3, $4);"],
    );
    ops.insert(
        SELECT_TABLE,
        vec![
            "SELECT dbname, collector, dateFrom, dateTo FROM {table} \
             WHERE collector = $1 AND dateFrom <= $2 AND dateTo > $2;",
        ],
    );
    // Range form used for read planning. The schema manager appends an
    // optional collector filter and the ORDER BY.
    ops.insert(
        SELECT_TABLE_RANGE,
        vec![
            "SELECT dbname, collector, dateFrom, dateTo FROM {table} \
             WHERE dateFrom < $2 AND dateTo > $1",
        ],
    );
    ops.insert(
        MAKE_NODE_TABLE,
        vec![
            "CREATE TABLE IF NOT EXISTS {table} (\
             ip varchar PRIMARY KEY, \
             name varchar, \
             isCollector boolean, \
             tableDumpDurationMinutes integer, \
             description varchar, \
             coords varchar, \
             address varchar);",
        ],
    );
    // update_id defaults server-side; inserts carry the 9 remaining columns.
    // gen_random_uuid() requires PostgreSQL 13 or later.
    ops.insert(
        MAKE_CAPTURE_TABLE,
        vec![
            "CREATE TABLE IF NOT EXISTS {table} (\
             update_id varchar PRIMARY KEY DEFAULT gen_random_uuid()::varchar, \
             timestamp timestamp, \
             collector_ip inet, \
             peer_ip inet, \
             as_path integer[], \
             next_hop inet, \
             origin_as integer, \
             adv_prefixes varchar[], \
             wdr_prefixes varchar[], \
             protomsg bytea);",
        ],
    );
    ops.insert(
        INSERT_CAPTURE_TABLE,
        vec![
            "INSERT INTO {table} \
             (timestamp, collector_ip, peer_ip, as_path, next_hop, origin_as, \
             adv_prefixes, wdr_prefixes, protomsg)",
        ],
    );
    // The read stream appends the subnet-overlap filter and the ORDER BY.
    ops.insert(
        SELECT_CAPTURE_TABLE,
        vec![
            "SELECT update_id, timestamp, collector_ip, peer_ip, as_path, next_hop, origin_as, \
             adv_prefixes, wdr_prefixes, protomsg FROM {table} \
             WHERE timestamp >= $1 AND timestamp < $2",
        ],
    );
    ops.insert(
        MAKE_ENTITY_TABLE,
        vec![
            "CREATE TABLE IF NOT EXISTS {table} (\
             name varchar PRIMARY KEY, \
             email varchar, \
             owned_origins integer[], \
             owned_prefixes varchar[]);",
        ],
    );
    ops.insert(
        INSERT_ENTITY_TABLE,
        vec![
            "INSERT INTO {table} (name, email, owned_origins, owned_prefixes) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (name) DO UPDATE SET email=EXCLUDED.email, \
             owned_origins=EXCLUDED.owned_origins, owned_prefixes=EXCLUDED.owned_prefixes;",
        ],
    );
    ops.insert(
        SELECT_ENTITY,
        vec!["SELECT name, email, owned_origins, owned_prefixes FROM {table}"],
    );

    ops
});

/// Per-dialect SQL template lookup
#[derive(Debug, Clone, Copy)]
pub struct DbOper {
    dialect: SqlDialect,
}

impl DbOper {
    pub fn postgres() -> DbOper {
        DbOper {
            dialect: SqlDialect::Postgres,
        }
    }

    /// Look up the template for a logical operation.
    ///
    /// Panics on an unknown op or a missing dialect entry.
    pub fn getdbop(&self, name: &str) -> &'static str {
        let templates = DBOPS
            .get(name)
            .unwrap_or_else(|| panic!("unknown database operation: {}", name));
        templates
            .get(self.dialect.index())
            .unwrap_or_else(|| panic!("operation {} has no {:?} template", name, self.dialect))
    }
}

/// Substitute the table name into a template
pub fn fill_template(tmpl: &str, table: &str) -> String {
    tmpl.replace("{table}", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_ops_present() {
        let oper = DbOper::postgres();
        for op in [
            CONNECT_NO_SSL,
            CONNECT_SSL,
            CHECK_SCHEMA,
            SELECT_NODE,
            INSERT_NODE,
            INSERT_MAIN_TABLE,
            MAKE_MAIN_TABLE,
            SELECT_TABLE,
            SELECT_TABLE_RANGE,
            MAKE_NODE_TABLE,
            MAKE_CAPTURE_TABLE,
            INSERT_CAPTURE_TABLE,
            SELECT_CAPTURE_TABLE,
            MAKE_ENTITY_TABLE,
            INSERT_ENTITY_TABLE,
            SELECT_ENTITY,
        ] {
            assert!(!oper.getdbop(op).is_empty());
        }
    }

    #[test]
    #[should_panic(expected = "unknown database operation")]
    fn test_missing_op_panics() {
        DbOper::postgres().getdbop("noSuchOp");
    }

    #[test]
    fn test_fill_template() {
        let filled = fill_template("SELECT * FROM {table};", "dbs");
        assert_eq!(filled, "SELECT * FROM dbs;");
    }
}
