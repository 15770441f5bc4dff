#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use device_data_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, DataError, DataLifecycle, DataSet, DataSetFilter,
    DataSetRepository, DataSetSelector, DataSetState, DataSetUpdate, DeduplicatorRef,
    DeletionState, FieldUpdate, FieldValue, FindOptions, IdMatch, Pagination, Record, RecordField,
    RecordFilter, RecordGroup, RecordRepository, RecordSort, RecordState, RecordUpdate,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

const DEVICE_DATA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_DEVICE_DATA_V1: &str = r"
CREATE TABLE IF NOT EXISTS data_sets (
  id TEXT PRIMARY KEY,
  userId TEXT NOT NULL,
  deviceId TEXT NOT NULL,
  uploadId TEXT NOT NULL,
  type TEXT NOT NULL DEFAULT 'dataset' CHECK (type = 'dataset'),
  state TEXT NOT NULL CHECK (state IN ('open', 'closed')),
  active INTEGER NOT NULL DEFAULT 0 CHECK (active IN (0, 1)),
  _deduplicator TEXT,
  createdTime TEXT NOT NULL,
  modifiedTime TEXT,
  deletedTime TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_data_sets_live_upload
  ON data_sets(userId, uploadId) WHERE deletedTime IS NULL;
CREATE INDEX IF NOT EXISTS idx_data_sets_user_device
  ON data_sets(userId, deviceId, createdTime);

CREATE TABLE IF NOT EXISTS device_data (
  id TEXT PRIMARY KEY,
  userId TEXT NOT NULL,
  uploadId TEXT NOT NULL,
  deviceId TEXT NOT NULL,
  type TEXT NOT NULL CHECK (type <> 'dataset'),
  _deduplicator TEXT,
  active INTEGER NOT NULL DEFAULT 0 CHECK (active IN (0, 1)),
  archivedDatasetId TEXT,
  archivedTime TEXT,
  time TEXT,
  payload TEXT NOT NULL DEFAULT '{}',
  createdTime TEXT NOT NULL,
  modifiedTime TEXT,
  deletedTime TEXT
);

CREATE INDEX IF NOT EXISTS idx_device_data_upload
  ON device_data(userId, uploadId);
CREATE INDEX IF NOT EXISTS idx_device_data_device_hash
  ON device_data(userId, deviceId, json_extract(_deduplicator, '$.hash'));
CREATE INDEX IF NOT EXISTS idx_device_data_archived
  ON device_data(userId, deviceId, archivedDatasetId);
";

const DATA_SET_CONTRACT_COLUMNS: &[&str] = &[
    "id",
    "userId",
    "deviceId",
    "uploadId",
    "type",
    "state",
    "active",
    "_deduplicator",
    "createdTime",
    "modifiedTime",
    "deletedTime",
];

const RECORD_CONTRACT_COLUMNS: &[&str] = &[
    "id",
    "userId",
    "uploadId",
    "deviceId",
    "type",
    "_deduplicator",
    "active",
    "archivedDatasetId",
    "archivedTime",
    "createdTime",
    "modifiedTime",
    "deletedTime",
];

const DATA_SET_COLUMNS: &str = "id, userId, deviceId, uploadId, state, active, _deduplicator,
    createdTime, modifiedTime, deletedTime";

const RECORD_COLUMNS: &str = "id, userId, uploadId, deviceId, type,
    json_extract(_deduplicator, '$.hash'), active, archivedDatasetId, archivedTime,
    time, payload, createdTime, modifiedTime, deletedTime";

const HASH_EXPRESSION: &str = "json_extract(_deduplicator, '$.hash')";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    Wal,
    Delete,
    Memory,
}

impl JournalMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SqliteStoreOptions {
    pub busy_timeout_ms: u64,
    pub journal_mode: JournalMode,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            journal_mode: JournalMode::Wal,
        }
    }
}

impl SqliteStoreOptions {
    pub const BUSY_TIMEOUT_MS_MAX: u64 = 600_000;

    pub fn validate(&self) -> Result<(), DataError> {
        if self.busy_timeout_ms > Self::BUSY_TIMEOUT_MS_MAX {
            return Err(DataError::Configuration(format!(
                "busy_timeout_ms MUST be <= {}",
                Self::BUSY_TIMEOUT_MS_MAX
            )));
        }
        Ok(())
    }

    /// Decodes and validates store options from JSON. Missing fields take
    /// their defaults.
    pub fn from_json(value: &Value) -> Result<Self, DataError> {
        let options: Self = serde_json::from_value(value.clone()).map_err(|err| {
            DataError::Configuration(format!("invalid store options JSON payload: {err}"))
        })?;
        options.validate()?;
        Ok(options)
    }
}

/// `SQLite` document store backing both the data set and record repositories.
///
/// Closing the store makes every repository call fail with
/// [`DataError::Precondition`].
pub struct SqliteDataStore {
    conn: Option<Connection>,
}

impl SqliteDataStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, &SqliteStoreOptions::default())
    }

    pub fn open_with_options(path: &Path, options: &SqliteStoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn, options)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::configure(
            conn,
            &SqliteStoreOptions {
                journal_mode: JournalMode::Memory,
                ..SqliteStoreOptions::default()
            },
        )
    }

    fn configure(conn: Connection, options: &SqliteStoreOptions) -> Result<Self> {
        options.validate().context("invalid sqlite store options")?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};",
            options.journal_mode.as_str(),
            options.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Some(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        ensure_field_contract(conn)?;

        conn.execute_batch(SCHEMA_DEVICE_DATA_V1)
            .context("failed to apply device data schema")?;

        let now = format_rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![DEVICE_DATA_MIGRATION_VERSION, now],
        )
        .context("failed to register device data schema migration")?;

        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, err)| err)
                .context("failed to close sqlite connection")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Lifecycle operations over this store acting as both repositories.
    #[must_use]
    pub fn lifecycle(&self) -> DataLifecycle<'_, Self, Self> {
        DataLifecycle::new(self, self)
    }

    fn conn(&self) -> Result<&Connection, DataError> {
        self.conn
            .as_ref()
            .ok_or_else(|| DataError::Precondition("sqlite data store is closed".to_string()))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => panic!("sqlite data store is closed"),
        }
    }
}

impl DataSetRepository for SqliteDataStore {
    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn get(&self, id: &str) -> Result<Option<DataSet>, DataError> {
        self.conn()?
            .query_row(
                &format!("SELECT {DATA_SET_COLUMNS} FROM data_sets WHERE id = ?1"),
                params![id],
                parse_data_set_row,
            )
            .optional()
            .map_err(|err| DataError::store("failed to get data set", err))
    }

    fn find_by_upload_id(
        &self,
        user_id: &str,
        upload_id: &str,
    ) -> Result<Option<DataSet>, DataError> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {DATA_SET_COLUMNS} FROM data_sets
                     WHERE userId = ?1 AND uploadId = ?2 AND deletedTime IS NULL"
                ),
                params![user_id, upload_id],
                parse_data_set_row,
            )
            .optional()
            .map_err(|err| DataError::store("failed to find data set by upload id", err))
    }

    fn list_for_user(
        &self,
        user_id: &str,
        filter: &DataSetFilter,
        pagination: &Pagination,
    ) -> Result<Vec<DataSet>, DataError> {
        let mut query = format!("SELECT {DATA_SET_COLUMNS} FROM data_sets WHERE userId = ?1");
        if !filter.deleted {
            query.push_str(" AND deletedTime IS NULL");
        }
        query.push_str(" ORDER BY createdTime DESC, id DESC LIMIT ?2 OFFSET ?3");

        let limit = to_sql_count(pagination.size)?;
        let offset = to_sql_count(pagination.offset()?)?;

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&query)
            .map_err(|err| DataError::store("failed to prepare data set listing", err))?;
        let rows = stmt
            .query_map(params![user_id, limit, offset], parse_data_set_row)
            .map_err(|err| DataError::store("failed to list data sets", err))?;
        collect_rows(rows).map_err(|err| DataError::store("failed to decode data sets", err))
    }

    fn insert(&self, data_set: &DataSet) -> Result<(), DataError> {
        let created_time = data_set.created_time.ok_or_else(|| {
            DataError::Validation("data set created_time MUST be stamped before insert".to_string())
        })?;
        let deduplicator = data_set
            .deduplicator
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| DataError::store("failed to serialize data set deduplicator", err))?;

        let result = self.conn()?.execute(
            "INSERT INTO data_sets(
                id, userId, deviceId, uploadId, type, state, active,
                _deduplicator, createdTime, modifiedTime, deletedTime
             ) VALUES (?1, ?2, ?3, ?4, 'dataset', ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                data_set.id,
                data_set.user_id,
                data_set.device_id,
                data_set.upload_id,
                data_set.state.as_str(),
                bool_to_sql(data_set.active),
                deduplicator,
                format_rfc3339(created_time)?,
                format_optional_time(data_set.modified_time)?,
                format_optional_time(data_set.deletion.deleted_time())?,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(DataError::Conflict(format!(
                "data set already exists for user {} and upload {}",
                data_set.user_id, data_set.upload_id
            ))),
            Err(err) => Err(DataError::store("failed to insert data set", err)),
        }
    }

    fn update(
        &self,
        id: &str,
        update: &DataSetUpdate,
        modified_time: OffsetDateTime,
    ) -> Result<bool, DataError> {
        let mut assignments = vec!["modifiedTime = ?"];
        let mut values = vec![SqlValue::Text(format_rfc3339(modified_time)?)];

        if let Some(state) = update.state {
            assignments.push("state = ?");
            values.push(SqlValue::Text(state.as_str().to_string()));
        }
        if let Some(active) = update.active {
            assignments.push("active = ?");
            values.push(SqlValue::Integer(bool_to_sql(active)));
        }
        if let Some(deduplicator) = &update.deduplicator {
            let encoded = serde_json::to_string(deduplicator)
                .map_err(|err| DataError::store("failed to serialize data set deduplicator", err))?;
            assignments.push("_deduplicator = ?");
            values.push(SqlValue::Text(encoded));
        }
        values.push(SqlValue::Text(id.to_string()));

        let changed = self
            .conn()?
            .execute(
                &format!(
                    "UPDATE data_sets SET {} WHERE id = ?",
                    assignments.join(", ")
                ),
                params_from_iter(values),
            )
            .map_err(|err| DataError::store("failed to update data set", err))?;
        Ok(changed > 0)
    }

    fn soft_delete(&self, id: &str, deleted_time: OffsetDateTime) -> Result<bool, DataError> {
        let deleted_time = format_rfc3339(deleted_time)?;
        let changed = self
            .conn()?
            .execute(
                "UPDATE data_sets SET deletedTime = ?1, modifiedTime = ?1
                 WHERE id = ?2 AND deletedTime IS NULL",
                params![deleted_time, id],
            )
            .map_err(|err| DataError::store("failed to soft-delete data set", err))?;
        Ok(changed > 0)
    }

    fn soft_delete_all(
        &self,
        selector: &DataSetSelector,
        deleted_time: OffsetDateTime,
    ) -> Result<usize, DataError> {
        let live_only = DataSetSelector {
            include_deleted: false,
            ..selector.clone()
        };
        let condition = data_set_condition(&live_only)?;

        let deleted_time = format_rfc3339(deleted_time)?;
        let mut values = vec![
            SqlValue::Text(deleted_time.clone()),
            SqlValue::Text(deleted_time),
        ];
        values.extend(condition.values);

        self.conn()?
            .execute(
                &format!(
                    "UPDATE data_sets SET deletedTime = ?, modifiedTime = ? WHERE {}",
                    condition.sql
                ),
                params_from_iter(values),
            )
            .map_err(|err| DataError::store("failed to soft-delete data sets", err))
    }

    fn hard_remove_all(&self, selector: &DataSetSelector) -> Result<usize, DataError> {
        let condition = data_set_condition(selector)?;
        self.conn()?
            .execute(
                &format!("DELETE FROM data_sets WHERE {}", condition.sql),
                params_from_iter(condition.values),
            )
            .map_err(|err| DataError::store("failed to remove data sets", err))
    }
}

impl RecordRepository for SqliteDataStore {
    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn find(&self, filter: &RecordFilter, options: &FindOptions) -> Result<Vec<Record>, DataError> {
        let condition = record_condition(filter);
        let order = match options.sort {
            Some(RecordSort::Time) => "time ASC, id ASC",
            Some(RecordSort::Id) | None => "id ASC",
        };

        let mut values = condition.values;
        values.push(SqlValue::Integer(match options.limit {
            Some(limit) => to_sql_count(limit)?,
            None => -1,
        }));
        values.push(SqlValue::Integer(to_sql_count(options.skip)?));

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM device_data WHERE {} ORDER BY {order} LIMIT ? OFFSET ?",
                condition.sql
            ))
            .map_err(|err| DataError::store("failed to prepare record query", err))?;
        let rows = stmt
            .query_map(params_from_iter(values), parse_record_row)
            .map_err(|err| DataError::store("failed to query records", err))?;
        collect_rows(rows).map_err(|err| DataError::store("failed to decode records", err))
    }

    fn insert_many(&self, records: &[Record], unordered: bool) -> Result<(), DataError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|err| DataError::store("failed to start record insert transaction", err))?;

        let mut failed = 0_usize;
        let mut first_failure = None;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO device_data(
                        id, userId, uploadId, deviceId, type, _deduplicator,
                        active, archivedDatasetId, archivedTime, time, payload,
                        createdTime, modifiedTime, deletedTime
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(|err| DataError::store("failed to prepare record insert", err))?;

            for record in records {
                if let Err(err) = insert_record(&mut stmt, record) {
                    log::debug!("record {} failed to insert: {err}", record.id);
                    failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                    if !unordered {
                        break;
                    }
                }
            }
        }

        tx.commit()
            .map_err(|err| DataError::store("failed to commit record insert transaction", err))?;

        match first_failure {
            Some(err) => Err(DataError::store(
                format!("failed to insert {failed} of {} records", records.len()),
                err,
            )),
            None => Ok(()),
        }
    }

    fn update_many(
        &self,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> Result<usize, DataError> {
        if update.is_empty() {
            return Err(DataError::Validation(
                "record update MUST set or unset at least one field".to_string(),
            ));
        }
        let condition = record_condition(filter);
        condition.require_constraint("record update")?;

        let mut assignments = Vec::new();
        let mut values = Vec::new();
        if let Some(active) = update.active {
            assignments.push("active = ?");
            values.push(SqlValue::Integer(bool_to_sql(active)));
        }
        match &update.archive {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(mark) => {
                assignments.push("archivedDatasetId = ?");
                values.push(SqlValue::Text(mark.data_set_id.clone()));
                assignments.push("archivedTime = ?");
                values.push(SqlValue::Text(format_rfc3339(mark.time)?));
            }
            FieldUpdate::Unset => {
                assignments.push("archivedDatasetId = NULL");
                assignments.push("archivedTime = NULL");
            }
        }
        if let Some(modified_time) = update.modified_time {
            assignments.push("modifiedTime = ?");
            values.push(SqlValue::Text(format_rfc3339(modified_time)?));
        }
        values.extend(condition.values);

        self.conn()?
            .execute(
                &format!(
                    "UPDATE device_data SET {} WHERE {}",
                    assignments.join(", "),
                    condition.sql
                ),
                params_from_iter(values),
            )
            .map_err(|err| DataError::store("failed to update records", err))
    }

    fn remove_many(&self, filter: &RecordFilter) -> Result<usize, DataError> {
        let condition = record_condition(filter);
        condition.require_constraint("record removal")?;

        self.conn()?
            .execute(
                &format!("DELETE FROM device_data WHERE {}", condition.sql),
                params_from_iter(condition.values),
            )
            .map_err(|err| DataError::store("failed to remove records", err))
    }

    fn distinct_values(
        &self,
        field: RecordField,
        filter: &RecordFilter,
    ) -> Result<BTreeSet<String>, DataError> {
        let condition = record_condition(filter);
        let column = record_column(field);

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT DISTINCT {column} FROM device_data WHERE {} AND {column} IS NOT NULL",
                condition.sql
            ))
            .map_err(|err| DataError::store("failed to prepare distinct query", err))?;
        let rows = stmt
            .query_map(params_from_iter(condition.values), |row| {
                row.get::<_, SqlValue>(0)
            })
            .map_err(|err| DataError::store("failed to query distinct values", err))?;

        let values = collect_rows(rows)
            .map_err(|err| DataError::store("failed to decode distinct values", err))?;
        Ok(values.into_iter().filter_map(sql_value_text).collect())
    }

    fn aggregate_group_by(
        &self,
        filter: &RecordFilter,
        group_keys: &[RecordField],
        collect: RecordField,
    ) -> Result<Vec<RecordGroup>, DataError> {
        if group_keys.is_empty() {
            return Err(DataError::Validation(
                "aggregate group keys MUST name at least one field".to_string(),
            ));
        }

        let condition = record_condition(filter);
        let keys = group_keys
            .iter()
            .map(|field| record_column(*field))
            .collect::<Vec<_>>()
            .join(", ");
        let collected = record_column(collect);

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {keys}, json_group_array({collected})
                 FROM device_data
                 WHERE {}
                 GROUP BY {keys}
                 ORDER BY {keys}",
                condition.sql
            ))
            .map_err(|err| DataError::store("failed to prepare aggregate query", err))?;

        let key_count = group_keys.len();
        let rows = stmt
            .query_map(params_from_iter(condition.values), |row| {
                let mut key = Vec::with_capacity(key_count);
                for (index, field) in group_keys.iter().enumerate() {
                    key.push(field_value(*field, row.get::<_, SqlValue>(index)?));
                }
                let collected_json: String = row.get(key_count)?;
                let values = parse_collected_values(key_count, &collected_json)?;
                Ok(RecordGroup { key, values })
            })
            .map_err(|err| DataError::store("failed to aggregate records", err))?;

        collect_rows(rows).map_err(|err| DataError::store("failed to decode record groups", err))
    }
}

/// A `WHERE` fragment with positional `?` parameters in order.
struct Condition {
    sql: String,
    values: Vec<SqlValue>,
    constrained: bool,
}

impl Condition {
    fn build(clauses: Vec<(&'static str, Option<SqlValue>)>) -> Self {
        let constrained = !clauses.is_empty();
        let mut parts = Vec::with_capacity(clauses.len());
        let mut values = Vec::new();
        for (clause, value) in clauses {
            parts.push(clause);
            if let Some(value) = value {
                values.push(value);
            }
        }

        Self {
            sql: if parts.is_empty() {
                "1 = 1".to_string()
            } else {
                parts.join(" AND ")
            },
            values,
            constrained,
        }
    }

    fn require_constraint(&self, operation: &str) -> Result<(), DataError> {
        if self.constrained {
            return Ok(());
        }
        Err(DataError::Validation(format!(
            "{operation} filter MUST constrain at least one field"
        )))
    }
}

fn record_condition(filter: &RecordFilter) -> Condition {
    let mut clauses = Vec::new();
    if let Some(user_id) = &filter.user_id {
        clauses.push(("userId = ?", Some(SqlValue::Text(user_id.clone()))));
    }
    if let Some(device_id) = &filter.device_id {
        clauses.push(("deviceId = ?", Some(SqlValue::Text(device_id.clone()))));
    }
    match &filter.upload_id {
        Some(IdMatch::Is(upload_id)) => {
            clauses.push(("uploadId = ?", Some(SqlValue::Text(upload_id.clone()))));
        }
        Some(IdMatch::IsNot(upload_id)) => {
            clauses.push(("uploadId <> ?", Some(SqlValue::Text(upload_id.clone()))));
        }
        None => {}
    }
    if let Some(active) = filter.active {
        clauses.push(("active = ?", Some(SqlValue::Integer(bool_to_sql(active)))));
    }
    if let Some(data_set_id) = &filter.archived_data_set_id {
        clauses.push((
            "archivedDatasetId = ?",
            Some(SqlValue::Text(data_set_id.clone())),
        ));
    }
    if let Some(hashes) = &filter.hashes {
        let encoded = Value::Array(hashes.iter().cloned().map(Value::String).collect());
        clauses.push((
            "json_extract(_deduplicator, '$.hash') IN (SELECT value FROM json_each(?))",
            Some(SqlValue::Text(encoded.to_string())),
        ));
    }
    if filter.has_hash {
        clauses.push(("json_extract(_deduplicator, '$.hash') IS NOT NULL", None));
    }
    Condition::build(clauses)
}

fn data_set_condition(selector: &DataSetSelector) -> Result<Condition, DataError> {
    let mut clauses = Vec::new();
    if let Some(user_id) = &selector.user_id {
        clauses.push(("userId = ?", Some(SqlValue::Text(user_id.clone()))));
    }
    if let Some(data_set_id) = &selector.data_set_id {
        clauses.push(("id = ?", Some(SqlValue::Text(data_set_id.clone()))));
    }
    if let Some(device_id) = &selector.device_id {
        clauses.push(("deviceId = ?", Some(SqlValue::Text(device_id.clone()))));
    }
    match &selector.upload_id {
        Some(IdMatch::Is(upload_id)) => {
            clauses.push(("uploadId = ?", Some(SqlValue::Text(upload_id.clone()))));
        }
        Some(IdMatch::IsNot(upload_id)) => {
            clauses.push(("uploadId <> ?", Some(SqlValue::Text(upload_id.clone()))));
        }
        None => {}
    }

    let condition = Condition::build(clauses);
    condition.require_constraint("data set")?;

    if selector.include_deleted {
        Ok(condition)
    } else {
        Ok(Condition {
            sql: format!("{} AND deletedTime IS NULL", condition.sql),
            ..condition
        })
    }
}

fn record_column(field: RecordField) -> &'static str {
    match field {
        RecordField::Hash => HASH_EXPRESSION,
        RecordField::Active => "active",
        RecordField::ArchivedDataSetId => "archivedDatasetId",
        RecordField::ArchivedTime => "archivedTime",
    }
}

fn field_value(field: RecordField, value: SqlValue) -> FieldValue {
    match (field, value) {
        (_, SqlValue::Null) => FieldValue::Null,
        (RecordField::Active, SqlValue::Integer(flag)) => FieldValue::Bool(flag == 1),
        (_, other) => sql_value_text(other).map_or(FieldValue::Null, FieldValue::Text),
    }
}

fn sql_value_text(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Integer(value) => Some(value.to_string()),
        SqlValue::Real(value) => Some(value.to_string()),
        SqlValue::Text(value) => Some(value),
        SqlValue::Blob(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn parse_collected_values(column: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    let values: Vec<Value> = serde_json::from_str(raw).map_err(|err| {
        invalid_data(
            column,
            rusqlite::types::Type::Text,
            format!("invalid collected values: {err}"),
        )
    })?;

    Ok(values
        .into_iter()
        .filter_map(|value| match value {
            Value::Null => None,
            Value::String(text) => Some(text),
            other => Some(other.to_string()),
        })
        .collect())
}

fn insert_record(
    stmt: &mut rusqlite::CachedStatement<'_>,
    record: &Record,
) -> Result<(), DataError> {
    record.validate()?;
    let created_time = record.created_time.ok_or_else(|| {
        DataError::Validation(format!(
            "record {} created_time MUST be stamped before insert",
            record.id
        ))
    })?;
    let (active, archived_data_set_id, archived_time) = state_columns(&record.state)?;
    let deduplicator = record
        .hash
        .as_ref()
        .map(|hash| serde_json::json!({ "hash": hash }).to_string());
    let payload = serde_json::to_string(&record.payload)
        .map_err(|err| DataError::store("failed to serialize record payload", err))?;

    stmt.execute(params![
        record.id,
        record.user_id,
        record.upload_id,
        record.device_id,
        record.kind,
        deduplicator,
        active,
        archived_data_set_id,
        archived_time,
        format_optional_time(record.time)?,
        payload,
        format_rfc3339(created_time)?,
        format_optional_time(record.modified_time)?,
        format_optional_time(record.deletion.deleted_time())?,
    ])
    .map_err(|err| DataError::store(format!("failed to insert record {}", record.id), err))?;

    Ok(())
}

fn state_columns(state: &RecordState) -> Result<(i64, Option<String>, Option<String>), DataError> {
    match state {
        RecordState::Inactive => Ok((0, None, None)),
        RecordState::Active => Ok((1, None, None)),
        RecordState::Archived(mark) => Ok((
            0,
            Some(mark.data_set_id.clone()),
            Some(format_rfc3339(mark.time)?),
        )),
    }
}

fn parse_data_set_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataSet> {
    let state_raw: String = row.get(4)?;
    let deduplicator_raw: Option<String> = row.get(6)?;

    let state = DataSetState::parse(&state_raw).ok_or_else(|| {
        invalid_data(
            4,
            rusqlite::types::Type::Text,
            format!("invalid state: {state_raw}"),
        )
    })?;

    let deduplicator = deduplicator_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<DeduplicatorRef>(raw).map_err(|err| {
                invalid_data(
                    6,
                    rusqlite::types::Type::Text,
                    format!("invalid _deduplicator: {err}"),
                )
            })
        })
        .transpose()?;

    Ok(DataSet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        upload_id: row.get(3)?,
        state,
        active: row.get::<_, i64>(5)? == 1,
        deduplicator,
        created_time: Some(parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?),
        modified_time: parse_optional_time(row, 8)?,
        deletion: DeletionState::from_deleted_time(parse_optional_time(row, 9)?),
    })
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let payload_raw: String = row.get(10)?;

    let state = RecordState::from_parts(
        row.get::<_, i64>(6)? == 1,
        row.get(7)?,
        parse_optional_time(row, 8)?,
    )
    .map_err(to_sql_error)?;

    let payload: Value = serde_json::from_str(&payload_raw).map_err(|err| {
        invalid_data(
            10,
            rusqlite::types::Type::Text,
            format!("invalid payload: {err}"),
        )
    })?;

    Ok(Record {
        id: row.get(0)?,
        user_id: row.get(1)?,
        upload_id: row.get(2)?,
        device_id: row.get(3)?,
        kind: row.get(4)?,
        hash: row.get(5)?,
        state,
        time: parse_optional_time(row, 9)?,
        payload,
        created_time: Some(parse_rfc3339_utc(&row.get::<_, String>(11)?).map_err(to_sql_error)?),
        modified_time: parse_optional_time(row, 12)?,
        deletion: DeletionState::from_deleted_time(parse_optional_time(row, 13)?),
    })
}

fn parse_optional_time(
    row: &rusqlite::Row<'_>,
    column: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<String>>(column)?
        .as_deref()
        .map(|value| parse_rfc3339_utc(value).map_err(to_sql_error))
        .transpose()
}

fn format_optional_time(value: Option<OffsetDateTime>) -> Result<Option<String>, DataError> {
    value.map(format_rfc3339).transpose()
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn to_sql_count(value: usize) -> Result<i64, DataError> {
    i64::try_from(value)
        .map_err(|_| DataError::Validation(format!("count {value} exceeds sqlite range")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn ensure_field_contract(conn: &Connection) -> Result<()> {
    if table_exists(conn, "data_sets")? {
        ensure_table_has_columns(conn, "data_sets", DATA_SET_CONTRACT_COLUMNS)?;
    }
    if table_exists(conn, "device_data")? {
        ensure_table_has_columns(conn, "device_data", RECORD_CONTRACT_COLUMNS)?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "device data field contract check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn invalid_data(
    column: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: DataError) -> rusqlite::Error {
    invalid_data(0, rusqlite::types::Type::Text, err.to_string())
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    rows.collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::*;
    use device_data_core::{UnarchiveReport, ARCHIVE_STATE_KEYS};
    use proptest::prelude::*;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn fixture_store() -> SqliteDataStore {
        init_logging();
        let store = must(SqliteDataStore::open_in_memory());
        must(store.migrate());
        store
    }

    fn created_data_set(store: &SqliteDataStore, upload_id: &str) -> DataSet {
        let mut data_set = DataSet::new("user-1", "device-1", upload_id);
        must(store.lifecycle().create_data_set(&mut data_set));
        data_set
    }

    fn seeded_data_set(store: &SqliteDataStore, upload_id: &str, hashes: &[&str]) -> DataSet {
        let data_set = created_data_set(store, upload_id);
        let mut records = hashes
            .iter()
            .map(|hash| Record::new("cbg").with_hash(*hash))
            .collect::<Vec<_>>();
        must(store.lifecycle().create_data_set_data(&data_set, &mut records));
        data_set
    }

    fn stamped_record(id: &str, hash: &str) -> Record {
        let mut record = Record::new("cbg").with_hash(hash);
        record.id = id.to_string();
        record.user_id = "user-1".to_string();
        record.upload_id = "upload-a".to_string();
        record.device_id = "device-1".to_string();
        record.created_time = Some(now_utc());
        record
    }

    fn states_by_hash(store: &SqliteDataStore, data_set: &DataSet) -> Vec<(String, RecordState)> {
        let filter = RecordFilter::for_user(&data_set.user_id)
            .upload(IdMatch::Is(data_set.upload_id.clone()));
        must(store.find(&filter, &FindOptions::default()))
            .into_iter()
            .map(|record| (record.hash.unwrap_or_default(), record.state))
            .collect()
    }

    fn count_rows(store: &SqliteDataStore, table: &str) -> i64 {
        must(store.connection().query_row(
            &format!("SELECT COUNT(*) FROM {table}"),
            [],
            |row| row.get(0),
        ))
    }

    #[test]
    fn migrate_is_idempotent_and_registers_version() {
        let store = fixture_store();
        must(store.migrate());

        let versions: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![DEVICE_DATA_MIGRATION_VERSION],
            |row| row.get(0),
        ));
        assert_eq!(versions, 1);
        must(ensure_table_has_columns(
            store.connection(),
            "device_data",
            RECORD_CONTRACT_COLUMNS,
        ));
        must(ensure_table_has_columns(
            store.connection(),
            "data_sets",
            DATA_SET_CONTRACT_COLUMNS,
        ));
    }

    #[test]
    fn migrate_rejects_legacy_table_missing_contract_column() {
        init_logging();
        let store = must(SqliteDataStore::open_in_memory());
        must(store.connection().execute_batch(
            "CREATE TABLE device_data (
                id TEXT PRIMARY KEY,
                userId TEXT NOT NULL,
                uploadId TEXT NOT NULL,
                deviceId TEXT NOT NULL,
                type TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                createdTime TEXT NOT NULL
             );",
        ));

        let err = match store.migrate() {
            Ok(()) => panic!("expected field contract failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("device_data._deduplicator"));
    }

    #[test]
    fn data_set_insert_conflicts_until_soft_deleted() {
        let store = fixture_store();
        let mut first = created_data_set(&store, "upload-a");

        let mut duplicate = DataSet::new("user-1", "device-1", "upload-a");
        duplicate.created_time = Some(now_utc());
        assert!(matches!(
            DataSetRepository::insert(&store, &duplicate),
            Err(DataError::Conflict(_))
        ));

        must(store.lifecycle().delete_data_set(&mut first));
        must(DataSetRepository::insert(&store, &duplicate));

        let live = must(store.find_by_upload_id("user-1", "upload-a"));
        assert_eq!(live.map(|data_set| data_set.id), Some(duplicate.id));
        assert_eq!(count_rows(&store, "data_sets"), 2);
    }

    #[test]
    fn unordered_insert_many_continues_past_failures() {
        let store = fixture_store();
        let records = vec![
            stamped_record("r1", "h1"),
            stamped_record("r1", "h2"),
            stamped_record("r3", "h3"),
        ];

        let err = match store.insert_many(&records, true) {
            Ok(()) => panic!("expected duplicate id failure"),
            Err(err) => err,
        };
        assert!(matches!(err, DataError::Store { .. }));
        assert!(err.to_string().contains("failed to insert 1 of 3 records"));
        assert_eq!(count_rows(&store, "device_data"), 2);
    }

    #[test]
    fn ordered_insert_many_stops_at_first_failure() {
        let store = fixture_store();
        let records = vec![
            stamped_record("r1", "h1"),
            stamped_record("r1", "h2"),
            stamped_record("r3", "h3"),
        ];

        assert!(store.insert_many(&records, false).is_err());
        assert_eq!(count_rows(&store, "device_data"), 1);
    }

    #[test]
    fn bulk_writes_require_a_constraining_filter() {
        let store = fixture_store();
        let activate = RecordUpdate::to_state(&RecordState::Active, now_utc());

        assert!(matches!(
            store.update_many(&RecordFilter::default(), &activate),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            store.update_many(&RecordFilter::for_user("user-1"), &RecordUpdate::default()),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            store.remove_many(&RecordFilter::default()),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            store.hard_remove_all(&DataSetSelector::default()),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            store.soft_delete_all(&DataSetSelector::default(), now_utc()),
            Err(DataError::Validation(_))
        ));
    }

    #[test]
    fn distinct_and_group_by_skip_missing_hashes() {
        let store = fixture_store();
        let data_set = seeded_data_set(&store, "upload-a", &["h1", "h1", "h2"]);
        let mut unhashed = vec![Record::new("basal")];
        must(
            store
                .lifecycle()
                .create_data_set_data(&data_set, &mut unhashed),
        );

        let own = RecordFilter::for_user("user-1").upload(IdMatch::Is("upload-a".to_string()));
        let hashes = must(store.distinct_values(RecordField::Hash, &own));
        assert_eq!(
            hashes,
            ["h1", "h2"]
                .into_iter()
                .map(str::to_string)
                .collect::<BTreeSet<_>>()
        );

        let groups = must(store.aggregate_group_by(
            &own.clone().with_hash(),
            &ARCHIVE_STATE_KEYS,
            RecordField::Hash,
        ));
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].key,
            vec![FieldValue::Bool(false), FieldValue::Null, FieldValue::Null]
        );
        let mut collected = groups[0].values.clone();
        collected.sort();
        assert_eq!(collected, vec!["h1", "h1", "h2"]);

        assert!(matches!(
            store.aggregate_group_by(&own, &[], RecordField::Hash),
            Err(DataError::Validation(_))
        ));
    }

    #[test]
    fn closed_store_rejects_repository_calls() {
        let mut store = fixture_store();
        let data_set = created_data_set(&store, "upload-a");
        must(store.close());
        must(store.close());

        assert!(store.is_closed());
        assert!(matches!(
            store.get(&data_set.id),
            Err(DataError::Precondition(_))
        ));
        assert!(matches!(
            store.lifecycle().destroy_data_for_user_by_id("user-1"),
            Err(DataError::Precondition(_))
        ));
        assert!(store.migrate().is_err());
    }

    #[test]
    fn unarchive_skips_inconsistent_groups_and_applies_the_rest() {
        let store = fixture_store();
        let lifecycle = store.lifecycle();

        let mut older = seeded_data_set(&store, "upload-a", &["h1", "h2"]);
        must(lifecycle.activate_data_set_data(&mut older));
        let mut newer = seeded_data_set(&store, "upload-b", &["h1", "h2"]);
        must(lifecycle.activate_data_set_data(&mut newer));
        assert_eq!(
            must(lifecycle.archive_device_data_using_hashes_from_data_set(&newer)),
            2
        );

        must(store.connection().execute(
            "UPDATE device_data
             SET active = 0, archivedDatasetId = 'upload-x'
             WHERE uploadId = 'upload-b' AND json_extract(_deduplicator, '$.hash') = 'h2'",
            [],
        ));

        let report = must(lifecycle.unarchive_device_data_using_hashes_from_data_set(&newer));
        assert_eq!(
            report,
            UnarchiveReport {
                restored_records: 1,
                applied_groups: 1,
                skipped_groups: 1,
            }
        );

        for (hash, state) in states_by_hash(&store, &older) {
            match hash.as_str() {
                "h1" => assert_eq!(state, RecordState::Active),
                "h2" => assert_eq!(
                    state.archive_mark().map(|mark| mark.data_set_id.as_str()),
                    Some("upload-b")
                ),
                other => panic!("unexpected hash {other}"),
            }
        }
    }

    #[test]
    fn inconsistent_stored_record_fails_to_decode() {
        let store = fixture_store();
        must(store.connection().execute(
            "INSERT INTO device_data(id, userId, uploadId, deviceId, type, active, archivedDatasetId, createdTime)
             VALUES ('bad', 'user-1', 'upload-a', 'device-1', 'cbg', 0, 'upload-b', '2026-02-07T12:00:00Z')",
            [],
        ));

        assert!(matches!(
            store.find(&RecordFilter::for_user("user-1"), &FindOptions::default()),
            Err(DataError::Store { .. })
        ));
    }

    #[test]
    fn store_options_decode_with_defaults_and_bounds() {
        let options = must(SqliteStoreOptions::from_json(&json!({ "busy_timeout_ms": 250 })));
        assert_eq!(options.busy_timeout_ms, 250);
        assert_eq!(options.journal_mode, JournalMode::Wal);

        let options = must(SqliteStoreOptions::from_json(
            &json!({ "journal_mode": "delete" }),
        ));
        assert_eq!(options.journal_mode, JournalMode::Delete);
        assert_eq!(options.busy_timeout_ms, 5_000);

        assert!(matches!(
            SqliteStoreOptions::from_json(&json!({ "busy_timeout_ms": 700_000 })),
            Err(DataError::Configuration(_))
        ));
        assert!(matches!(
            SqliteStoreOptions::from_json(&json!({ "journal": "wal" })),
            Err(DataError::Configuration(_))
        ));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        init_logging();
        let db_path =
            std::env::temp_dir().join(format!("device-data-reopen-{}.sqlite3", Ulid::new()));
        let options = SqliteStoreOptions {
            journal_mode: JournalMode::Delete,
            ..SqliteStoreOptions::default()
        };

        let mut store = must(SqliteDataStore::open_with_options(&db_path, &options));
        must(store.migrate());
        let data_set = created_data_set(&store, "upload-a");
        must(store.close());

        let reopened = must(SqliteDataStore::open_with_options(&db_path, &options));
        must(reopened.migrate());
        let fetched = must(reopened.lifecycle().get_data_set_by_id(&data_set.id));
        assert_eq!(fetched.upload_id, "upload-a");
        assert_eq!(fetched.created_time, data_set.created_time);
        drop(reopened);

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_activation_converges(record_count in 0usize..12, repeats in 1usize..4) {
            let store = fixture_store();
            let hashes = (0..record_count).map(|index| format!("h{index}")).collect::<Vec<_>>();
            let hash_refs = hashes.iter().map(String::as_str).collect::<Vec<_>>();
            let mut data_set = seeded_data_set(&store, "upload-a", &hash_refs);

            for _ in 0..repeats {
                let activated = must(store.lifecycle().activate_data_set_data(&mut data_set));
                assert_eq!(activated, record_count);
                assert!(states_by_hash(&store, &data_set)
                    .iter()
                    .all(|(_, state)| *state == RecordState::Active));
            }

            let stored = must(store.lifecycle().get_data_set_by_id(&data_set.id));
            assert!(stored.active);
        }

        #[test]
        fn prop_archive_round_trip_restores_prior_states(
            older_hashes in prop::collection::btree_set("h[0-9]", 1..6),
            newer_hashes in prop::collection::btree_set("h[0-9]", 1..6),
        ) {
            let store = fixture_store();
            let lifecycle = store.lifecycle();
            let older_refs = older_hashes.iter().map(String::as_str).collect::<Vec<_>>();
            let newer_refs = newer_hashes.iter().map(String::as_str).collect::<Vec<_>>();

            let mut older = seeded_data_set(&store, "upload-a", &older_refs);
            must(lifecycle.activate_data_set_data(&mut older));
            let mut newer = seeded_data_set(&store, "upload-b", &newer_refs);
            must(lifecycle.activate_data_set_data(&mut newer));

            let archived = must(lifecycle.archive_device_data_using_hashes_from_data_set(&newer));
            assert_eq!(archived, older_hashes.intersection(&newer_hashes).count());
            for (hash, state) in states_by_hash(&store, &older) {
                if newer_hashes.contains(&hash) {
                    assert_eq!(
                        state.archive_mark().map(|mark| mark.data_set_id.clone()),
                        Some("upload-b".to_string())
                    );
                } else {
                    assert_eq!(state, RecordState::Active);
                }
            }

            let report = must(lifecycle.unarchive_device_data_using_hashes_from_data_set(&newer));
            assert_eq!(report.restored_records, archived);
            assert_eq!(report.skipped_groups, 0);
            assert!(states_by_hash(&store, &older)
                .iter()
                .all(|(_, state)| *state == RecordState::Active));
        }
    }
}
