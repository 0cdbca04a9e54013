use crate::db::pool::ShippingDbManager;
use crate::error::AgentError;
use r2d2::Pool;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Key role a column plays in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    None,
    Primary,
    Foreign,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub key: KeyRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Immutable view of the database structure at one point in time. A single
/// snapshot is threaded through an entire request so generation and
/// validation never disagree about what exists.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Compact CREATE TABLE listing fed to the SQL model.
    pub fn to_prompt_listing(&self) -> String {
        let mut listing = String::new();
        for table in &self.tables {
            listing.push_str(&format!("CREATE TABLE {} (\n", table.name));
            let column_lines: Vec<String> = table
                .columns
                .iter()
                .map(|col| {
                    let nullable = if col.nullable { "" } else { " NOT NULL" };
                    let role = match col.key {
                        KeyRole::Primary => " -- primary key",
                        KeyRole::Foreign => " -- foreign key",
                        KeyRole::None => "",
                    };
                    format!("    \"{}\" {}{}{}", col.name, col.data_type, nullable, role)
                })
                .collect();
            listing.push_str(&column_lines.join(",\n"));
            listing.push_str("\n);\n");
        }
        listing
    }

    /// Lowercased table and column vocabulary, split on underscores and
    /// camelCase boundaries. Used by the classifier for overlap checks.
    pub fn terms(&self) -> HashSet<String> {
        let mut terms = HashSet::new();
        for table in &self.tables {
            collect_terms(&table.name, &mut terms);
            for column in &table.columns {
                collect_terms(&column.name, &mut terms);
            }
        }
        terms
    }
}

fn collect_terms(identifier: &str, terms: &mut HashSet<String>) {
    terms.insert(identifier.to_lowercase());
    let mut word = String::new();
    for ch in identifier.chars() {
        if ch == '_' || ch.is_ascii_digit() {
            if word.len() > 2 {
                terms.insert(word.to_lowercase());
            }
            word.clear();
        } else if ch.is_uppercase() && !word.is_empty() {
            if word.len() > 2 {
                terms.insert(word.to_lowercase());
            }
            word.clear();
            word.push(ch);
        } else {
            word.push(ch);
        }
    }
    if word.len() > 2 {
        terms.insert(word.to_lowercase());
    }
}

type FetchResult = Result<Arc<SchemaSnapshot>, String>;

/// Introspects and caches the database schema. Snapshots live for a
/// configurable TTL; concurrent refreshes coalesce onto a single
/// introspection and every waiter observes the same outcome.
pub struct SchemaInspector {
    pool: Pool<ShippingDbManager>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<SchemaSnapshot>)>>,
    in_flight: Mutex<Option<Arc<OnceCell<FetchResult>>>>,
}

impl SchemaInspector {
    pub fn new(pool: Pool<ShippingDbManager>, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            cached: RwLock::new(None),
            in_flight: Mutex::new(None),
        }
    }

    /// Returns the cached snapshot without touching the database.
    pub fn cached(&self) -> Option<Arc<SchemaSnapshot>> {
        self.cached
            .read()
            .unwrap()
            .as_ref()
            .map(|(_, snap)| Arc::clone(snap))
    }

    /// Returns the current snapshot, introspecting the database when the
    /// cached one has expired.
    pub async fn fetch(&self) -> Result<Arc<SchemaSnapshot>, AgentError> {
        if let Some(snapshot) = self.fresh() {
            return Ok(snapshot);
        }

        let cell = {
            let mut slot = self.in_flight.lock().unwrap();
            match slot.as_ref() {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    *slot = Some(Arc::clone(&cell));
                    cell
                }
            }
        };

        let result = cell
            .get_or_init(|| async {
                match self.introspect().await {
                    Ok(snapshot) => {
                        let snapshot = Arc::new(snapshot);
                        *self.cached.write().unwrap() =
                            Some((Instant::now(), Arc::clone(&snapshot)));
                        Ok(snapshot)
                    }
                    Err(message) => Err(message),
                }
            })
            .await
            .clone();

        // Retire the completed flight so the next expiry starts a new one.
        {
            let mut slot = self.in_flight.lock().unwrap();
            if let Some(current) = slot.as_ref() {
                if Arc::ptr_eq(current, &cell) {
                    *slot = None;
                }
            }
        }

        result.map_err(AgentError::SchemaUnavailable)
    }

    /// Drops the cached snapshot and refetches.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>, AgentError> {
        *self.cached.write().unwrap() = None;
        self.fetch().await
    }

    fn fresh(&self) -> Option<Arc<SchemaSnapshot>> {
        let guard = self.cached.read().unwrap();
        match guard.as_ref() {
            Some((fetched_at, snapshot)) if fetched_at.elapsed() < self.ttl => {
                Some(Arc::clone(snapshot))
            }
            _ => None,
        }
    }

    async fn introspect(&self) -> Result<SchemaSnapshot, String> {
        info!("Introspecting database schema");
        let pool = self.pool.clone();

        let snapshot = tokio::task::spawn_blocking(move || -> Result<SchemaSnapshot, String> {
            let conn = pool
                .get()
                .map_err(|e| format!("cannot establish database connection: {}", e))?;

            let mut tables = Vec::new();

            let mut table_stmt = conn
                .prepare(
                    "SELECT table_name FROM information_schema.tables \
                     WHERE table_schema NOT IN ('information_schema', 'pg_catalog') \
                       AND table_type = 'BASE TABLE' \
                     ORDER BY table_name",
                )
                .map_err(|e| e.to_string())?;
            let table_names: Vec<String> = table_stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| e.to_string())?
                .filter_map(Result::ok)
                .collect();

            for table_name in &table_names {
                let mut column_stmt = conn
                    .prepare(
                        "SELECT column_name, data_type, is_nullable \
                         FROM information_schema.columns \
                         WHERE table_name = ? \
                         ORDER BY ordinal_position",
                    )
                    .map_err(|e| e.to_string())?;
                let columns: Vec<ColumnDescriptor> = column_stmt
                    .query_map([table_name], |row| {
                        Ok(ColumnDescriptor {
                            name: row.get::<_, String>(0)?,
                            data_type: row.get::<_, String>(1)?,
                            nullable: row.get::<_, String>(2)? == "YES",
                            key: KeyRole::None,
                        })
                    })
                    .map_err(|e| e.to_string())?
                    .filter_map(Result::ok)
                    .collect();

                tables.push(TableDescriptor {
                    name: table_name.clone(),
                    columns,
                });
            }

            // Key roles are advisory prompt context; introspection of
            // constraints may not be available on every database file.
            match conn.prepare(
                "SELECT kcu.table_name, kcu.column_name, tc.constraint_type \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                 WHERE tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')",
            ) {
                Ok(mut key_stmt) => {
                    let keys: Vec<(String, String, String)> = key_stmt
                        .query_map([], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        })
                        .map(|rows| rows.filter_map(Result::ok).collect())
                        .unwrap_or_default();

                    for (table_name, column_name, constraint_type) in keys {
                        if let Some(table) = tables
                            .iter_mut()
                            .find(|t| t.name.eq_ignore_ascii_case(&table_name))
                        {
                            if let Some(column) = table
                                .columns
                                .iter_mut()
                                .find(|c| c.name.eq_ignore_ascii_case(&column_name))
                            {
                                column.key = if constraint_type == "PRIMARY KEY" {
                                    KeyRole::Primary
                                } else {
                                    KeyRole::Foreign
                                };
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Key constraint introspection unavailable: {}", e);
                }
            }

            Ok(SchemaSnapshot { tables })
        })
        .await
        .map_err(|e| format!("introspection task failed: {}", e))??;

        info!("Schema snapshot holds {} tables", snapshot.tables.len());
        Ok(snapshot)
    }
}
