use duckdb::{AccessMode, Config, Connection};
use r2d2::ManageConnection;

/// r2d2 connection manager for the shipping database. Connections are
/// opened read-only by default; the core never issues DDL or DML.
pub struct ShippingDbManager {
    connection_string: String,
    read_only: bool,
}

impl ShippingDbManager {
    pub fn new(connection_string: String, read_only: bool) -> Self {
        Self {
            connection_string,
            read_only,
        }
    }
}

impl ManageConnection for ShippingDbManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.read_only {
            let config = Config::default().access_mode(AccessMode::ReadOnly)?;
            Connection::open_with_flags(&self.connection_string, config)
        } else {
            Connection::open(&self.connection_string)
        }
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_connections_reject_writes() {
        let path = std::env::temp_dir().join(format!(
            "shipquery-readonly-{}.duckdb",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        // Seed through a writable connection, then reopen read-only.
        {
            let conn = Connection::open(&path).expect("open writable");
            conn.execute_batch(
                "CREATE TABLE shipment (id INTEGER); INSERT INTO shipment VALUES (1);",
            )
            .expect("seed");
        }

        let manager = ShippingDbManager::new(path.to_string_lossy().into_owned(), true);
        let conn = manager.connect().expect("open read-only");

        let count: i64 = conn
            .query_row("SELECT count(*) FROM shipment", [], |row| row.get(0))
            .expect("read");
        assert_eq!(count, 1);

        assert!(conn.execute("INSERT INTO shipment VALUES (2)", []).is_err());
        assert!(conn.execute_batch("DROP TABLE shipment").is_err());

        drop(conn);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn writable_connections_allow_setup() {
        let manager = ShippingDbManager::new(":memory:".to_string(), false);
        let conn = manager.connect().expect("open");
        conn.execute_batch("CREATE TABLE shipment (id INTEGER);")
            .expect("ddl");
    }
}
