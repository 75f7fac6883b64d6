//! Live `StatusSource` over a synchronous MySQL connection.

use mysql::prelude::{ColumnIndex, Queryable};
use mysql::{Conn, OptsBuilder, Row};
use tracing::debug;

use super::CollectError;
use super::traits::{MasterStatus, SlaveStatus, StatusSource};
use crate::config::MysqlOptions;

pub struct MysqlSource {
    conn: Conn,
}

impl MysqlSource {
    pub fn connect(options: &MysqlOptions) -> Result<Self, CollectError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(options.host.as_str()))
            .tcp_port(options.port)
            .user(Some(options.user.as_str()))
            .pass(options.password.as_deref())
            .socket(options.socket.as_deref());
        let conn = Conn::new(opts).map_err(|e| CollectError::Connection(e.to_string()))?;
        debug!(host = %options.host, port = options.port, "connected to MySQL");
        Ok(Self { conn })
    }

    fn name_value_pairs(&mut self, query: &str) -> Result<Vec<(String, String)>, CollectError> {
        let rows: Vec<Row> = self
            .conn
            .query(query)
            .map_err(|e| CollectError::Query(format!("{}: {}", query, e)))?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = text_column(row, 0)?;
                let value = text_column(row, 1).unwrap_or_default();
                Some((name, value))
            })
            .collect())
    }

    fn first_row(&mut self, query: &str) -> Result<Option<Row>, CollectError> {
        self.conn
            .query_first::<Row, _>(query)
            .map_err(|e| CollectError::Query(format!("{}: {}", query, e)))
    }
}

fn text_column<I: ColumnIndex>(row: &Row, idx: I) -> Option<String> {
    row.get_opt::<Option<String>, I>(idx)
        .and_then(|r| r.ok())
        .flatten()
}

fn int_column(row: &Row, name: &str) -> Option<i64> {
    row.get_opt::<Option<i64>, &str>(name)
        .and_then(|r| r.ok())
        .flatten()
}

impl StatusSource for MysqlSource {
    fn global_status(&mut self) -> Result<Vec<(String, String)>, CollectError> {
        self.name_value_pairs("SHOW GLOBAL STATUS")
    }

    fn global_variables(&mut self) -> Result<Vec<(String, String)>, CollectError> {
        self.name_value_pairs("SHOW GLOBAL VARIABLES")
    }

    fn master_status(&mut self) -> Result<Option<MasterStatus>, CollectError> {
        Ok(self.first_row("SHOW MASTER STATUS")?.map(|row| MasterStatus {
            file: text_column(&row, "File").unwrap_or_default(),
            position: int_column(&row, "Position"),
        }))
    }

    fn slave_status(&mut self) -> Result<Option<SlaveStatus>, CollectError> {
        Ok(self.first_row("SHOW SLAVE STATUS")?.map(|row| SlaveStatus {
            read_master_log_pos: int_column(&row, "Read_Master_Log_Pos"),
            relay_log_pos: int_column(&row, "Relay_Log_Pos"),
            exec_master_log_pos: int_column(&row, "Exec_Master_Log_Pos"),
            relay_log_space: int_column(&row, "Relay_Log_Space"),
            seconds_behind_master: int_column(&row, "Seconds_Behind_Master"),
        }))
    }
}
