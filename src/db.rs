//! SQLite-backed [`CalcSource`].
//!
//! Schema:
//! - `table_meta`: logical table id to physical table name
//! - `field_meta`: field definitions, stored as JSON
//! - `reference`: one row per dependency edge, derived from field definitions on write
//! - `records`: cells as a JSON object plus audit metadata
//!
//! Foreign-key hosts are ordinary tables named by each link's options, created with
//! [`Transaction::create_fk_host`].

use crate::{
    changes::ChangeSet,
    error::CalcError,
    properties::{Field, FieldId, Record, RecordId, TableId},
    query::{CalcSource, ForeignKeyRef, KeySide},
    topo::FieldEdge,
};
use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions},
    ConnectOptions, Row,
};
use sqlx::{migrate::MigrationType, Pool, QueryBuilder};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    result::Result,
    str::FromStr,
};

pub const RECALC_DB: &str = "sqlite:recalc.db";

/// Double-quoted SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// JSON path of a cell inside `records.cells`.
fn cell_path(field_id: &FieldId) -> String {
    format!("$.\"{}\"", field_id.as_str().replace('"', "\\\""))
}

fn json_ids<T: serde::Serialize>(ids: &[T]) -> Result<String, CalcError> {
    Ok(serde_json::to_string(ids)?)
}

/// Batches writes into a single multi-statement query.
pub struct Transaction<'a> {
    qb: QueryBuilder<'a, Sqlite>,
    pub staged: usize,
}

impl<'a> Default for Transaction<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Transaction<'a> {
    pub fn new() -> Transaction<'a> {
        Transaction {
            qb: QueryBuilder::<Sqlite>::new(""),
            staged: 0,
        }
    }

    pub async fn execute(&mut self, connection: &Pool<Sqlite>) -> Result<(), CalcError> {
        if self.staged == 0 {
            return Ok(());
        }
        let query = self.qb.build();
        query.execute(connection).await.map_err(|e| {
            tracing::error!(
                "[Transaction.execute] SQL error executing {} staged statements: {}",
                self.staged,
                e
            );
            e
        })?;
        self.qb.reset();
        self.staged = 0;
        Ok(())
    }

    pub fn add_table(&mut self, table_id: &TableId, db_table_name: &str) {
        self.qb
            .push("INSERT OR REPLACE INTO table_meta(id, db_table_name) ");
        self.qb.push_values(vec![(table_id, db_table_name)], |mut b, (id, name)| {
            b.push_bind::<String>(id.to_string())
                .push_bind::<String>(name.to_string());
        });
        self.qb.push("; ");
        self.staged += 1;
    }

    /// Stores `field` and replaces its incoming dependency edges.
    pub fn add_field(&mut self, field: &Field) -> Result<(), CalcError> {
        let definition = serde_json::to_string(field)?;
        self.qb
            .push("INSERT OR REPLACE INTO field_meta(id, table_id, definition) ");
        self.qb.push_values(vec![field], |mut b, field| {
            b.push_bind::<String>(field.id.to_string())
                .push_bind::<String>(field.table_id.to_string())
                .push_bind::<String>(definition.clone());
        });
        self.qb.push("; DELETE FROM reference WHERE to_field_id = ");
        self.qb.push_bind::<String>(field.id.to_string());
        self.qb.push("; ");

        let dependencies = field.dependency_field_ids();
        if !dependencies.is_empty() {
            self.qb
                .push("INSERT OR IGNORE INTO reference(from_field_id, to_field_id) ");
            self.qb.push_values(dependencies, |mut b, dep| {
                b.push_bind::<String>(dep.into())
                    .push_bind::<String>(field.id.to_string());
            });
            self.qb.push("; ");
        }
        self.staged += 1;
        Ok(())
    }

    pub fn remove_field(&mut self, field_id: &FieldId) {
        self.qb.push("DELETE FROM field_meta WHERE id = ");
        self.qb.push_bind::<String>(field_id.to_string());
        self.qb
            .push("; DELETE FROM reference WHERE from_field_id = ");
        self.qb.push_bind::<String>(field_id.to_string());
        self.qb.push(" OR to_field_id = ");
        self.qb.push_bind::<String>(field_id.to_string());
        self.qb.push("; ");
        self.staged += 1;
    }

    pub fn add_record(&mut self, table_id: &TableId, record: &Record) -> Result<(), CalcError> {
        let cells = serde_json::to_string(&record.cells)?;
        self.qb.push(
            "INSERT OR REPLACE INTO records(table_id, id, cells, auto_number, created_time, \
             last_modified_time, created_by, last_modified_by) ",
        );
        self.qb.push_values(vec![record], |mut b, record| {
            b.push_bind::<String>(table_id.to_string())
                .push_bind::<String>(record.id.to_string())
                .push_bind::<String>(cells.clone())
                .push_bind::<Option<i64>>(record.auto_number)
                .push_bind::<Option<String>>(record.created_time.clone())
                .push_bind::<Option<String>>(record.last_modified_time.clone())
                .push_bind::<Option<String>>(record.created_by.clone())
                .push_bind::<Option<String>>(record.last_modified_by.clone());
        });
        self.qb.push("; ");
        self.staged += 1;
        Ok(())
    }

    /// Writes every new value of `changes` into `records.cells`; a cleared value removes the key.
    pub fn apply_changes(&mut self, changes: &ChangeSet) -> Result<(), CalcError> {
        for change in changes.changes() {
            let path = cell_path(&change.field_id);
            match &change.new_value {
                Some(value) => {
                    self.qb.push("UPDATE records SET cells = json_set(cells, ");
                    self.qb.push_bind::<String>(path);
                    self.qb.push(", json(");
                    self.qb.push_bind::<String>(serde_json::to_string(value)?);
                    self.qb.push("))");
                }
                None => {
                    self.qb.push("UPDATE records SET cells = json_remove(cells, ");
                    self.qb.push_bind::<String>(path);
                    self.qb.push(")");
                }
            }
            self.qb.push(" WHERE table_id = ");
            self.qb.push_bind::<String>(change.table_id.into());
            self.qb.push(" AND id = ");
            self.qb.push_bind::<String>(change.record_id.into());
            self.qb.push("; ");
            self.staged += 1;
        }
        Ok(())
    }

    pub fn create_fk_host(&mut self, fk: &ForeignKeyRef) {
        let (self_key, foreign_key) = (quote_ident(&fk.self_key), quote_ident(&fk.foreign_key));
        self.qb.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({self_key} TEXT NOT NULL, {foreign_key} TEXT NOT NULL, \
             UNIQUE({self_key}, {foreign_key})); ",
            quote_ident(&fk.host_table)
        ));
        self.staged += 1;
    }

    pub fn link(&mut self, fk: &ForeignKeyRef, self_id: &RecordId, foreign_id: &RecordId) {
        self.qb.push(format!(
            "INSERT OR IGNORE INTO {}({}, {}) ",
            quote_ident(&fk.host_table),
            quote_ident(&fk.self_key),
            quote_ident(&fk.foreign_key)
        ));
        self.qb
            .push_values(vec![(self_id, foreign_id)], |mut b, (self_id, foreign_id)| {
                b.push_bind::<String>(self_id.to_string())
                    .push_bind::<String>(foreign_id.to_string());
            });
        self.qb.push("; ");
        self.staged += 1;
    }

    pub fn unlink(&mut self, fk: &ForeignKeyRef, self_id: &RecordId, foreign_id: &RecordId) {
        self.qb.push(format!(
            "DELETE FROM {} WHERE {} = ",
            quote_ident(&fk.host_table),
            quote_ident(&fk.self_key)
        ));
        self.qb.push_bind::<String>(self_id.to_string());
        self.qb
            .push(format!(" AND {} = ", quote_ident(&fk.foreign_key)));
        self.qb.push_bind::<String>(foreign_id.to_string());
        self.qb.push("; ");
        self.staged += 1;
    }
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    /// Applies a calculation result in one transaction.
    pub async fn apply(&self, changes: &ChangeSet) -> Result<(), CalcError> {
        let mut tx = Transaction::new();
        tx.apply_changes(changes)?;
        tx.execute(&self.0).await?;
        tracing::debug!("[DbConnection.apply] applied {} cell changes", changes.len());
        Ok(())
    }

    async fn fetch_fields(&self, sql: &str, bind: String) -> Result<Vec<Field>, CalcError> {
        let fields = sqlx::query_as::<_, Field>(sql)
            .bind(bind)
            .fetch_all(&self.0)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[DbConnection.fetch_fields] SQL error processing '{}'\n\terror: {}",
                    sql,
                    e
                );
                e
            })?;
        Ok(fields)
    }
}

impl CalcSource for DbConnection {
    #[tracing::instrument(skip(self))]
    async fn reachable_edges(&self, field_ids: &[FieldId]) -> Result<Vec<FieldEdge>, CalcError> {
        let sql = "\
            WITH RECURSIVE connected(id) AS ( \
                SELECT value FROM json_each(?) \
                UNION \
                SELECT CASE WHEN r.from_field_id = c.id THEN r.to_field_id ELSE r.from_field_id END \
                FROM reference r JOIN connected c \
                ON r.from_field_id = c.id OR r.to_field_id = c.id \
            ) \
            SELECT from_field_id, to_field_id FROM reference \
            WHERE from_field_id IN (SELECT id FROM connected) \
            OR to_field_id IN (SELECT id FROM connected) \
            ORDER BY rowid";
        let rows = sqlx::query_as::<_, (String, String)>(sql)
            .bind(json_ids(field_ids)?)
            .fetch_all(&self.0)
            .await
            .map_err(|e| {
                tracing::error!("[DbConnection.reachable_edges] SQL error: {}", e);
                e
            })?;
        Ok(rows
            .into_iter()
            .map(|(from, to)| FieldEdge::new(from, to))
            .collect())
    }

    async fn fields(&self, field_ids: &[FieldId]) -> Result<Vec<Field>, CalcError> {
        self.fetch_fields(
            "SELECT definition FROM field_meta WHERE id IN (SELECT value FROM json_each(?))",
            json_ids(field_ids)?,
        )
        .await
    }

    async fn table_fields(&self, table_id: &TableId) -> Result<Vec<Field>, CalcError> {
        self.fetch_fields(
            "SELECT definition FROM field_meta WHERE table_id = ? ORDER BY rowid",
            table_id.to_string(),
        )
        .await
    }

    async fn db_table_names(
        &self,
        table_ids: &[TableId],
    ) -> Result<BTreeMap<TableId, String>, CalcError> {
        let rows = sqlx::query(
            "SELECT id, db_table_name FROM table_meta WHERE id IN (SELECT value FROM json_each(?))",
        )
        .bind(json_ids(table_ids)?)
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!("[DbConnection.db_table_names] SQL error: {}", e);
            e
        })?;
        rows.iter()
            .map(|row| -> Result<(TableId, String), CalcError> {
                let id: String = row.try_get("id")?;
                let name: String = row.try_get("db_table_name")?;
                Ok((TableId::from(id), name))
            })
            .collect()
    }

    async fn link_fields_by_lookup_field(
        &self,
        field_ids: &[FieldId],
    ) -> Result<Vec<Field>, CalcError> {
        self.fetch_fields(
            "SELECT definition FROM field_meta \
             WHERE json_extract(definition, '$.type') = 'link' \
             AND json_extract(definition, '$.options.lookupFieldId') \
             IN (SELECT value FROM json_each(?))",
            json_ids(field_ids)?,
        )
        .await
    }

    async fn records(
        &self,
        table_id: &TableId,
        record_ids: &[RecordId],
    ) -> Result<Vec<Record>, CalcError> {
        let sql = "SELECT * FROM records \
                   WHERE table_id = ? AND id IN (SELECT value FROM json_each(?))";
        let mut found: BTreeMap<RecordId, Record> = sqlx::query_as::<_, Record>(sql)
            .bind(table_id.to_string())
            .bind(json_ids(record_ids)?)
            .fetch_all(&self.0)
            .await
            .map_err(|e| {
                tracing::error!("[DbConnection.records] SQL error on {}: {}", table_id, e);
                e
            })?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Ok(record_ids
            .iter()
            .filter_map(|id| found.remove(id))
            .collect())
    }

    async fn record_ids(
        &self,
        table_id: &TableId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RecordId>, CalcError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT id FROM records WHERE table_id = ? ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(table_id.to_string())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.0)
        .await?;
        Ok(rows.into_iter().map(|(id,)| RecordId::from(id)).collect())
    }

    async fn fk_pairs(
        &self,
        fk: &ForeignKeyRef,
        side: KeySide,
        ids: &[RecordId],
    ) -> Result<Vec<(RecordId, RecordId)>, CalcError> {
        let key = match side {
            KeySide::SelfKey => &fk.self_key,
            KeySide::ForeignKey => &fk.foreign_key,
        };
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} IN (SELECT value FROM json_each(?)) ORDER BY rowid",
            quote_ident(&fk.self_key),
            quote_ident(&fk.foreign_key),
            quote_ident(&fk.host_table),
            quote_ident(key)
        );
        let rows = sqlx::query_as::<_, (String, String)>(&sql)
            .bind(json_ids(ids)?)
            .fetch_all(&self.0)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[DbConnection.fk_pairs] SQL error processing '{}'\n\terror: {}",
                    sql,
                    e
                );
                e
            })?;
        Ok(rows
            .into_iter()
            .map(|(self_id, foreign_id)| (self_id.into(), foreign_id.into()))
            .collect())
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, sqlx::Error> {
    let fqdb = format!("sqlite:{}", db_path.display());
    tracing::debug!("Initializing recalc db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);

    use sqlx::pool::PoolOptions;
    let pool = PoolOptions::<Sqlite>::new().connect_with(options).await?;

    let migrations = MigrationList(vec![Migration {
        version: 1,
        description: "create_initial_tables",
        sql: "\
            CREATE TABLE table_meta (id TEXT PRIMARY KEY, db_table_name TEXT NOT NULL); \
            CREATE TABLE field_meta (id TEXT PRIMARY KEY, table_id TEXT NOT NULL, definition TEXT NOT NULL); \
            CREATE TABLE reference (from_field_id TEXT NOT NULL, to_field_id TEXT NOT NULL, UNIQUE(from_field_id, to_field_id)); \
            CREATE INDEX reference_to ON reference(to_field_id); \
            CREATE TABLE records (table_id TEXT NOT NULL, id TEXT NOT NULL, cells TEXT NOT NULL DEFAULT '{}', \
                auto_number INTEGER, created_time TEXT, last_modified_time TEXT, created_by TEXT, \
                last_modified_by TEXT, PRIMARY KEY(table_id, id));",
        kind: MigrationType::ReversibleUp,
    }]);
    let migrator = Migrator::new(migrations.clone()).await?;
    migrator.run(&pool).await?;

    let field_res = sqlx::query("SELECT COUNT(*) as fcount FROM field_meta;")
        .fetch_one(&pool)
        .await?;
    let ref_res = sqlx::query("SELECT COUNT(*) as rcount FROM reference;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tField count:\t{:?} \n \
         \tReference count:\t{:?}",
        field_res.get::<u32, usize>(0),
        ref_res.get::<u32, usize>(0)
    );

    Ok(pool)
}
