//! Data set lifecycle and hash-based archival for device measurement uploads.
//!
//! The crate defines the persisted data model, the repository seams a
//! document store must provide, and [`DataLifecycle`], which composes those
//! repositories into create/activate/archive/unarchive/delete operations.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod lifecycle;

pub use lifecycle::{DataLifecycle, RemovalReport, UnarchiveReport};

/// Discriminator persisted on data set documents. Records never use it.
pub const DATA_SET_KIND: &str = "dataset";

pub const PAGINATION_SIZE_DEFAULT: usize = 100;
pub const PAGINATION_SIZE_MAXIMUM: usize = 1_000;

/// Group keys used to recover the pre-archival state of a data set's records.
pub const ARCHIVE_STATE_KEYS: [RecordField; 3] = [
    RecordField::Active,
    RecordField::ArchivedDataSetId,
    RecordField::ArchivedTime,
];

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{message}: {source}")]
    Store {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl DataError {
    pub fn store(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Prefixes store failures with the calling operation. Other variants
    /// pass through untouched.
    #[must_use]
    pub fn with_operation(self, operation: &str) -> Self {
        match self {
            Self::Store { message, source } => Self::Store {
                message: format!("{operation}: {message}"),
                source,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataSetState {
    Open,
    Closed,
}

impl DataSetState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Soft/hard deletion state shared by data sets and records.
///
/// `Live` and `SoftDeleted` are what a store can hold; `Purged` describes a
/// document whose row has been removed outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeletionState {
    #[default]
    Live,
    SoftDeleted {
        at: OffsetDateTime,
    },
    Purged,
}

impl DeletionState {
    #[must_use]
    pub fn from_deleted_time(deleted_time: Option<OffsetDateTime>) -> Self {
        match deleted_time {
            Some(at) => Self::SoftDeleted { at },
            None => Self::Live,
        }
    }

    /// Marks a live document deleted. An already soft-deleted document keeps
    /// its original deletion time.
    ///
    /// # Errors
    /// Returns [`DataError::Precondition`] for purged documents.
    pub fn soft_delete(self, at: OffsetDateTime) -> Result<Self, DataError> {
        match self {
            Self::Live => Ok(Self::SoftDeleted { at }),
            Self::SoftDeleted { .. } => Ok(self),
            Self::Purged => Err(DataError::Precondition(
                "purged documents cannot be soft-deleted".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn purge(self) -> Self {
        Self::Purged
    }

    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    #[must_use]
    pub fn deleted_time(self) -> Option<OffsetDateTime> {
        match self {
            Self::SoftDeleted { at } => Some(at),
            Self::Live | Self::Purged => None,
        }
    }
}

/// Identifies the hashing scheme that produced a data set's record hashes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct DeduplicatorRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSet {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub upload_id: String,
    pub state: DataSetState,
    pub active: bool,
    pub deduplicator: Option<DeduplicatorRef>,
    pub created_time: Option<OffsetDateTime>,
    pub modified_time: Option<OffsetDateTime>,
    pub deletion: DeletionState,
}

impl DataSet {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        upload_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            upload_id: upload_id.into(),
            state: DataSetState::Open,
            active: false,
            deduplicator: None,
            created_time: None,
            modified_time: None,
            deletion: DeletionState::Live,
        }
    }

    #[must_use]
    pub fn with_deduplicator(mut self, name: &str, version: &str) -> Self {
        self.deduplicator = Some(DeduplicatorRef {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    /// Validates the identifying fields every lifecycle call relies on.
    ///
    /// # Errors
    /// Returns [`DataError::Validation`] when `id`, `user_id`, `upload_id` or
    /// `device_id` is empty.
    pub fn validate(&self) -> Result<(), DataError> {
        require_identifier("data set id", &self.id)?;
        require_identifier("data set user_id", &self.user_id)?;
        require_identifier("data set upload_id", &self.upload_id)?;
        require_identifier("data set device_id", &self.device_id)?;
        Ok(())
    }
}

/// Which data set archived a record, and when.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ArchiveMark {
    pub data_set_id: String,
    pub time: OffsetDateTime,
}

/// Visibility of a record. The persisted triple
/// `(active, archivedDatasetId, archivedTime)` maps onto exactly one variant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Inactive,
    Active,
    Archived(ArchiveMark),
}

impl RecordState {
    /// Rebuilds a state from its persisted triple.
    ///
    /// # Errors
    /// Returns [`DataError::Validation`] when the archive fields are not both
    /// present or both absent, or are present on an active record.
    pub fn from_parts(
        active: bool,
        archived_data_set_id: Option<String>,
        archived_time: Option<OffsetDateTime>,
    ) -> Result<Self, DataError> {
        match (active, archived_data_set_id, archived_time) {
            (true, None, None) => Ok(Self::Active),
            (false, None, None) => Ok(Self::Inactive),
            (false, Some(data_set_id), Some(time)) => {
                Ok(Self::Archived(ArchiveMark { data_set_id, time }))
            }
            (active, data_set_id, time) => Err(DataError::Validation(format!(
                "inconsistent record state: active={active} archived_data_set_id={data_set_id:?} archived_time={time:?}"
            ))),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    #[must_use]
    pub fn archive_mark(&self) -> Option<&ArchiveMark> {
        match self {
            Self::Archived(mark) => Some(mark),
            Self::Inactive | Self::Active => None,
        }
    }
}

impl Display for RecordState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
            Self::Archived(mark) => write!(f, "archived by {}", mark.data_set_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub user_id: String,
    pub upload_id: String,
    pub device_id: String,
    pub kind: String,
    pub hash: Option<String>,
    pub state: RecordState,
    pub time: Option<OffsetDateTime>,
    pub payload: Value,
    pub created_time: Option<OffsetDateTime>,
    pub modified_time: Option<OffsetDateTime>,
    pub deletion: DeletionState,
}

impl Record {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: String::new(),
            upload_id: String::new(),
            device_id: String::new(),
            kind: kind.into(),
            hash: None,
            state: RecordState::Inactive,
            time: None,
            payload: Value::Object(Map::default()),
            created_time: None,
            modified_time: None,
            deletion: DeletionState::Live,
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: OffsetDateTime) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validates a record before it is stamped and inserted.
    ///
    /// # Errors
    /// Returns [`DataError::Validation`] when the kind is empty or reserved
    /// for data sets, or when a present hash is empty.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.kind.trim().is_empty() {
            return Err(DataError::Validation(
                "record kind MUST be provided".to_string(),
            ));
        }

        if self.kind == DATA_SET_KIND {
            return Err(DataError::Validation(format!(
                "record kind MUST NOT be {DATA_SET_KIND:?}"
            )));
        }

        if matches!(self.hash.as_deref(), Some(hash) if hash.is_empty()) {
            return Err(DataError::Validation(
                "record hash MUST NOT be empty when present".to_string(),
            ));
        }

        Ok(())
    }
}

/// Persisted record fields addressable by distinct/group-by queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordField {
    Hash,
    Active,
    ArchivedDataSetId,
    ArchivedTime,
}

impl RecordField {
    /// Persisted key for the field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hash => "_deduplicator.hash",
            Self::Active => "active",
            Self::ArchivedDataSetId => "archivedDatasetId",
            Self::ArchivedTime => "archivedTime",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Text(String),
}

impl FieldValue {
    fn into_optional_text(self, field: RecordField) -> Result<Option<String>, DataError> {
        match self {
            Self::Null => Ok(None),
            Self::Text(value) => Ok(Some(value)),
            Self::Bool(value) => Err(DataError::Validation(format!(
                "{} MUST be text, found boolean {value}",
                field.as_str()
            ))),
        }
    }
}

/// One group produced by [`RecordRepository::aggregate_group_by`]: the group
/// key values (in requested key order) and the collected field values.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordGroup {
    pub key: Vec<FieldValue>,
    pub values: Vec<String>,
}

/// A data set's records sharing one archive-state triple, with their hashes.
///
/// The triple is kept raw so inconsistent stored states can be reported
/// rather than rejected at decode time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArchiveGroup {
    pub active: bool,
    pub archived_data_set_id: Option<String>,
    pub archived_time: Option<String>,
    pub hashes: BTreeSet<String>,
}

impl ArchiveGroup {
    /// Returns the state records archived by this group's owner are restored
    /// to.
    ///
    /// # Errors
    /// Returns [`DataError::Validation`] unless `active=false` coincides with
    /// both archive fields being present (and `active=true` with both absent),
    /// or when the archive time is not RFC3339 UTC.
    pub fn restore_state(&self) -> Result<RecordState, DataError> {
        match (
            self.active,
            self.archived_data_set_id.as_deref(),
            self.archived_time.as_deref(),
        ) {
            (true, None, None) => Ok(RecordState::Active),
            (false, Some(data_set_id), Some(time)) if !data_set_id.is_empty() => {
                Ok(RecordState::Archived(ArchiveMark {
                    data_set_id: data_set_id.to_string(),
                    time: parse_rfc3339_utc(time)?,
                }))
            }
            (active, data_set_id, time) => Err(DataError::Validation(format!(
                "inconsistent archive group: active={active} archived_data_set_id={data_set_id:?} archived_time={time:?}"
            ))),
        }
    }
}

impl TryFrom<RecordGroup> for ArchiveGroup {
    type Error = DataError;

    fn try_from(group: RecordGroup) -> Result<Self, Self::Error> {
        let [active, archived_data_set_id, archived_time] =
            <[FieldValue; 3]>::try_from(group.key).map_err(|key| {
                DataError::Validation(format!(
                    "archive group key MUST have {} fields, found {}",
                    ARCHIVE_STATE_KEYS.len(),
                    key.len()
                ))
            })?;

        let active = match active {
            FieldValue::Bool(value) => value,
            other => {
                return Err(DataError::Validation(format!(
                    "active MUST be boolean, found {other:?}"
                )))
            }
        };

        Ok(Self {
            active,
            archived_data_set_id: archived_data_set_id
                .into_optional_text(RecordField::ArchivedDataSetId)?,
            archived_time: archived_time.into_optional_text(RecordField::ArchivedTime)?,
            hashes: group.values.into_iter().collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum IdMatch {
    Is(String),
    IsNot(String),
}

/// Conjunctive record selector. Unset fields do not constrain the match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordFilter {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub upload_id: Option<IdMatch>,
    pub active: Option<bool>,
    pub archived_data_set_id: Option<String>,
    pub hashes: Option<BTreeSet<String>>,
    pub has_hash: bool,
}

impl RecordFilter {
    #[must_use]
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    #[must_use]
    pub fn upload(mut self, upload_id: IdMatch) -> Self {
        self.upload_id = Some(upload_id);
        self
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    #[must_use]
    pub fn archived_by(mut self, data_set_id: &str) -> Self {
        self.archived_data_set_id = Some(data_set_id.to_string());
        self
    }

    #[must_use]
    pub fn hash_in(mut self, hashes: BTreeSet<String>) -> Self {
        self.hashes = Some(hashes);
        self
    }

    #[must_use]
    pub fn with_hash(mut self) -> Self {
        self.has_hash = true;
        self
    }
}

/// Set/unset instruction for an optional persisted field.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum FieldUpdate<T> {
    Keep,
    Set(T),
    Unset,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        Self::Keep
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordUpdate {
    pub active: Option<bool>,
    pub archive: FieldUpdate<ArchiveMark>,
    pub modified_time: Option<OffsetDateTime>,
}

impl RecordUpdate {
    /// Overwrites the whole visibility triple with `state`.
    #[must_use]
    pub fn to_state(state: &RecordState, modified_time: OffsetDateTime) -> Self {
        let (active, archive) = match state {
            RecordState::Inactive => (false, FieldUpdate::Unset),
            RecordState::Active => (true, FieldUpdate::Unset),
            RecordState::Archived(mark) => (false, FieldUpdate::Set(mark.clone())),
        };

        Self {
            active: Some(active),
            archive,
            modified_time: Some(modified_time),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && matches!(self.archive, FieldUpdate::Keep)
            && self.modified_time.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordSort {
    Time,
    Id,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct FindOptions {
    pub sort: Option<RecordSort>,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 0,
            size: PAGINATION_SIZE_DEFAULT,
        }
    }
}

impl Pagination {
    /// # Errors
    /// Returns [`DataError::Validation`] when the size is outside
    /// `1..=PAGINATION_SIZE_MAXIMUM` or the offset overflows.
    pub fn validate(&self) -> Result<(), DataError> {
        if !(1..=PAGINATION_SIZE_MAXIMUM).contains(&self.size) {
            return Err(DataError::Validation(format!(
                "pagination size MUST be in [1, {PAGINATION_SIZE_MAXIMUM}]"
            )));
        }

        self.offset().map(|_| ())
    }

    /// # Errors
    /// Returns [`DataError::Validation`] when `page * size` overflows.
    pub fn offset(&self) -> Result<usize, DataError> {
        self.page
            .checked_mul(self.size)
            .ok_or_else(|| DataError::Validation("pagination offset overflows".to_string()))
    }

    /// # Errors
    /// See [`Pagination::validate`].
    pub fn find_options(&self, sort: RecordSort) -> Result<FindOptions, DataError> {
        self.validate()?;
        Ok(FindOptions {
            sort: Some(sort),
            skip: self.offset()?,
            limit: Some(self.size),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DataSetFilter {
    /// Include soft-deleted data sets.
    pub deleted: bool,
}

/// Conjunctive data set selector for bulk soft/hard deletion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DataSetSelector {
    pub user_id: Option<String>,
    pub data_set_id: Option<String>,
    pub device_id: Option<String>,
    pub upload_id: Option<IdMatch>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DataSetUpdate {
    pub state: Option<DataSetState>,
    pub active: Option<bool>,
    pub deduplicator: Option<DeduplicatorRef>,
}

impl DataSetUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.active.is_none() && self.deduplicator.is_none()
    }
}

/// Document access for data sets. Implementations know nothing about records.
pub trait DataSetRepository {
    fn is_closed(&self) -> bool;

    fn get(&self, id: &str) -> Result<Option<DataSet>, DataError>;

    /// Returns the non-deleted data set for `(user_id, upload_id)`, if any.
    fn find_by_upload_id(
        &self,
        user_id: &str,
        upload_id: &str,
    ) -> Result<Option<DataSet>, DataError>;

    fn list_for_user(
        &self,
        user_id: &str,
        filter: &DataSetFilter,
        pagination: &Pagination,
    ) -> Result<Vec<DataSet>, DataError>;

    /// Fails with [`DataError::Conflict`] when a non-deleted data set with the
    /// same `(user_id, upload_id)` exists.
    fn insert(&self, data_set: &DataSet) -> Result<(), DataError>;

    /// Returns `false` when no data set has `id`.
    fn update(
        &self,
        id: &str,
        update: &DataSetUpdate,
        modified_time: OffsetDateTime,
    ) -> Result<bool, DataError>;

    /// Returns `false` when `id` is unknown or already deleted.
    fn soft_delete(&self, id: &str, deleted_time: OffsetDateTime) -> Result<bool, DataError>;

    fn soft_delete_all(
        &self,
        selector: &DataSetSelector,
        deleted_time: OffsetDateTime,
    ) -> Result<usize, DataError>;

    fn hard_remove_all(&self, selector: &DataSetSelector) -> Result<usize, DataError>;
}

/// Bulk access to measurement records.
pub trait RecordRepository {
    fn is_closed(&self) -> bool;

    fn find(&self, filter: &RecordFilter, options: &FindOptions) -> Result<Vec<Record>, DataError>;

    /// With `unordered`, a failing document does not stop the remaining ones,
    /// but any failure is still reported as a single error.
    fn insert_many(&self, records: &[Record], unordered: bool) -> Result<(), DataError>;

    fn update_many(&self, filter: &RecordFilter, update: &RecordUpdate)
        -> Result<usize, DataError>;

    fn remove_many(&self, filter: &RecordFilter) -> Result<usize, DataError>;

    /// Distinct non-null values of `field` among matching records.
    fn distinct_values(
        &self,
        field: RecordField,
        filter: &RecordFilter,
    ) -> Result<BTreeSet<String>, DataError>;

    /// Groups matching records by `group_keys`, collecting non-null values of
    /// `collect` per group.
    fn aggregate_group_by(
        &self,
        filter: &RecordFilter,
        group_keys: &[RecordField],
        collect: RecordField,
    ) -> Result<Vec<RecordGroup>, DataError>;
}

/// # Errors
/// Returns [`DataError::Validation`] when `value` is empty or whitespace.
pub fn require_identifier(name: &str, value: &str) -> Result<(), DataError> {
    if value.trim().is_empty() {
        return Err(DataError::Validation(format!("{name} MUST be provided")));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DataError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DataError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DataError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DataError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// The fraction is always nine digits so formatted values order
/// chronologically as text.
///
/// # Errors
/// Returns [`DataError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DataError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .map_err(|err| DataError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn archive_group(
        active: bool,
        archived_data_set_id: Option<&str>,
        archived_time: Option<&str>,
    ) -> ArchiveGroup {
        ArchiveGroup {
            active,
            archived_data_set_id: archived_data_set_id.map(str::to_string),
            archived_time: archived_time.map(str::to_string),
            hashes: ["h1".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn data_set_validation_names_the_missing_field() {
        let mut data_set = DataSet::new("user-1", "device-1", "upload-1");
        assert!(data_set.validate().is_ok());

        data_set.device_id = "  ".to_string();
        match data_set.validate() {
            Err(DataError::Validation(message)) => assert!(message.contains("device_id")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn record_kind_cannot_be_dataset() {
        assert!(Record::new("cbg").validate().is_ok());
        assert!(matches!(
            Record::new(DATA_SET_KIND).validate(),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            Record::new("").validate(),
            Err(DataError::Validation(_))
        ));
        assert!(matches!(
            Record::new("cbg").with_hash("").validate(),
            Err(DataError::Validation(_))
        ));
    }

    #[test]
    fn record_state_requires_archive_fields_together() {
        let at = must_utc("2026-02-07T12:00:00Z");

        assert_eq!(
            must_ok(RecordState::from_parts(true, None, None)),
            RecordState::Active
        );
        assert_eq!(
            must_ok(RecordState::from_parts(false, None, None)),
            RecordState::Inactive
        );
        assert_eq!(
            must_ok(RecordState::from_parts(false, Some("u-2".to_string()), Some(at))),
            RecordState::Archived(ArchiveMark {
                data_set_id: "u-2".to_string(),
                time: at,
            })
        );

        assert!(RecordState::from_parts(false, Some("u-2".to_string()), None).is_err());
        assert!(RecordState::from_parts(false, None, Some(at)).is_err());
        assert!(RecordState::from_parts(true, Some("u-2".to_string()), Some(at)).is_err());
    }

    #[test]
    fn archive_group_restore_accepts_only_consistent_triples() {
        assert_eq!(
            must_ok(archive_group(true, None, None).restore_state()),
            RecordState::Active
        );

        let restored = must_ok(
            archive_group(false, Some("upload-c"), Some("2026-02-07T12:00:00Z")).restore_state(),
        );
        assert_eq!(
            restored.archive_mark().map(|mark| mark.data_set_id.as_str()),
            Some("upload-c")
        );

        for invalid in [
            archive_group(false, None, None),
            archive_group(false, Some("upload-c"), None),
            archive_group(false, None, Some("2026-02-07T12:00:00Z")),
            archive_group(true, Some("upload-c"), Some("2026-02-07T12:00:00Z")),
            archive_group(false, Some(""), Some("2026-02-07T12:00:00Z")),
            archive_group(false, Some("upload-c"), Some("yesterday")),
        ] {
            assert!(
                matches!(invalid.restore_state(), Err(DataError::Validation(_))),
                "expected {invalid:?} to be rejected"
            );
        }
    }

    #[test]
    fn archive_group_decodes_from_record_group() {
        let group = RecordGroup {
            key: vec![
                FieldValue::Bool(false),
                FieldValue::Text("upload-b".to_string()),
                FieldValue::Text("2026-02-07T12:00:00Z".to_string()),
            ],
            values: vec!["h2".to_string(), "h1".to_string(), "h1".to_string()],
        };

        let decoded = must_ok(ArchiveGroup::try_from(group));
        assert!(!decoded.active);
        assert_eq!(decoded.archived_data_set_id.as_deref(), Some("upload-b"));
        assert_eq!(decoded.hashes.len(), 2);

        let malformed = RecordGroup {
            key: vec![FieldValue::Text("true".to_string()), FieldValue::Null],
            values: Vec::new(),
        };
        assert!(ArchiveGroup::try_from(malformed).is_err());
    }

    #[test]
    fn deletion_state_transitions() {
        let first = must_utc("2026-02-07T12:00:00Z");
        let second = must_utc("2026-02-08T12:00:00Z");

        let deleted = must_ok(DeletionState::Live.soft_delete(first));
        assert_eq!(deleted.deleted_time(), Some(first));

        let again = must_ok(deleted.soft_delete(second));
        assert_eq!(again.deleted_time(), Some(first));

        let purged = again.purge();
        assert!(!purged.is_live());
        assert_eq!(purged.deleted_time(), None);
        assert!(matches!(
            purged.soft_delete(second),
            Err(DataError::Precondition(_))
        ));

        assert_eq!(DeletionState::from_deleted_time(None), DeletionState::Live);
    }

    #[test]
    fn record_update_to_state_sets_or_unsets_archive_fields() {
        let at = must_utc("2026-02-07T12:00:00Z");

        let activate = RecordUpdate::to_state(&RecordState::Active, at);
        assert_eq!(activate.active, Some(true));
        assert_eq!(activate.archive, FieldUpdate::Unset);

        let mark = ArchiveMark {
            data_set_id: "upload-b".to_string(),
            time: at,
        };
        let archive = RecordUpdate::to_state(&RecordState::Archived(mark.clone()), at);
        assert_eq!(archive.active, Some(false));
        assert_eq!(archive.archive, FieldUpdate::Set(mark));
        assert!(!archive.is_empty());
        assert!(RecordUpdate::default().is_empty());
    }

    #[test]
    fn store_errors_gain_operation_context() {
        let err = DataError::store("failed to update records", std::io::Error::other("disk"))
            .with_operation("unable to archive device data");
        assert_eq!(
            err.to_string(),
            "unable to archive device data: failed to update records: disk"
        );

        let passthrough =
            DataError::Conflict("duplicate".to_string()).with_operation("unable to create");
        assert!(matches!(passthrough, DataError::Conflict(message) if message == "duplicate"));
    }

    #[test]
    fn pagination_bounds() {
        assert!(Pagination::default().validate().is_ok());
        assert!(Pagination { page: 0, size: 0 }.validate().is_err());
        assert!(Pagination {
            page: 0,
            size: PAGINATION_SIZE_MAXIMUM + 1
        }
        .validate()
        .is_err());
        assert!(Pagination {
            page: usize::MAX,
            size: 2
        }
        .validate()
        .is_err());

        let options = must_ok(Pagination { page: 2, size: 10 }.find_options(RecordSort::Time));
        assert_eq!(options.skip, 20);
        assert_eq!(options.limit, Some(10));
    }

    #[test]
    fn rfc3339_round_trip_preserves_subseconds() {
        let value = must_utc("2026-02-07T12:00:00.123456789Z");
        let formatted = must_ok(format_rfc3339(value));
        assert_eq!(must_utc(&formatted), value);

        let whole = must_ok(format_rfc3339(must_utc("2026-02-07T12:00:01Z")));
        let fraction = must_ok(format_rfc3339(must_utc("2026-02-07T12:00:00.5Z")));
        assert_eq!(whole, "2026-02-07T12:00:01.000000000Z");
        assert!(fraction < whole);
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }
}
