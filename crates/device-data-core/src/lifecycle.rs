use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{
    now_utc, require_identifier, ArchiveGroup, ArchiveMark, DataError, DataSet, DataSetFilter,
    DataSetRepository, DataSetSelector, DataSetUpdate, DeletionState, IdMatch, Pagination, Record,
    RecordField, RecordFilter, RecordRepository, RecordSort, RecordState, RecordUpdate,
    ARCHIVE_STATE_KEYS,
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnarchiveReport {
    pub restored_records: usize,
    pub applied_groups: usize,
    pub skipped_groups: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovalReport {
    pub records_removed: usize,
    pub data_sets_removed: usize,
}

/// Data set lifecycle over a data set repository and a record repository.
///
/// Every call is synchronous and issues its store requests in sequence.
/// Archive and unarchive are idempotent but not atomic as a whole; callers
/// serialize them per `(user_id, device_id)`.
pub struct DataLifecycle<'a, D: ?Sized, R: ?Sized> {
    data_sets: &'a D,
    records: &'a R,
}

impl<'a, D, R> DataLifecycle<'a, D, R>
where
    D: DataSetRepository + ?Sized,
    R: RecordRepository + ?Sized,
{
    #[must_use]
    pub fn new(data_sets: &'a D, records: &'a R) -> Self {
        Self { data_sets, records }
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.data_sets.is_closed() || self.records.is_closed() {
            return Err(DataError::Precondition("data store is closed".to_string()));
        }
        Ok(())
    }

    /// # Errors
    /// [`DataError::NotFound`] when no data set has `id`.
    pub fn get_data_set_by_id(&self, id: &str) -> Result<DataSet, DataError> {
        self.ensure_open()?;
        require_identifier("data set id", id)?;

        self.data_sets
            .get(id)
            .map_err(|err| err.with_operation("unable to get data set by id"))?
            .ok_or_else(|| DataError::NotFound(format!("data set {id}")))
    }

    /// Lists a user's data sets, newest first.
    ///
    /// # Errors
    /// [`DataError::Validation`] for an empty user id or invalid pagination.
    pub fn get_data_sets_for_user_by_id(
        &self,
        user_id: &str,
        filter: &DataSetFilter,
        pagination: &Pagination,
    ) -> Result<Vec<DataSet>, DataError> {
        self.ensure_open()?;
        require_identifier("user_id", user_id)?;
        pagination.validate()?;

        self.data_sets
            .list_for_user(user_id, filter, pagination)
            .map_err(|err| err.with_operation("unable to get data sets for user by id"))
    }

    /// Inserts a new, open data set and stamps its `created_time`.
    ///
    /// # Errors
    /// [`DataError::Conflict`] when a live data set with the same
    /// `(user_id, upload_id)` exists; [`DataError::Validation`] for missing
    /// identifying fields.
    pub fn create_data_set(&self, data_set: &mut DataSet) -> Result<(), DataError> {
        self.ensure_open()?;
        data_set.validate()?;

        if self
            .data_sets
            .find_by_upload_id(&data_set.user_id, &data_set.upload_id)
            .map_err(|err| err.with_operation("unable to create data set"))?
            .is_some()
        {
            return Err(DataError::Conflict(format!(
                "data set already exists for user {} and upload {}",
                data_set.user_id, data_set.upload_id
            )));
        }

        let mut created = data_set.clone();
        created.created_time = Some(now_utc());
        created.modified_time = None;
        created.deletion = DeletionState::Live;

        self.data_sets
            .insert(&created)
            .map_err(|err| err.with_operation("unable to create data set"))?;

        log::debug!(
            "created data set {} for user {} upload {}",
            created.id,
            created.user_id,
            created.upload_id
        );
        *data_set = created;
        Ok(())
    }

    /// # Errors
    /// [`DataError::Validation`] for an empty id or update,
    /// [`DataError::NotFound`] when no data set has `id`.
    pub fn update_data_set(&self, id: &str, update: &DataSetUpdate) -> Result<DataSet, DataError> {
        self.ensure_open()?;
        require_identifier("data set id", id)?;
        if update.is_empty() {
            return Err(DataError::Validation(
                "data set update MUST change at least one field".to_string(),
            ));
        }

        let updated = self
            .data_sets
            .update(id, update, now_utc())
            .map_err(|err| err.with_operation("unable to update data set"))?;
        if !updated {
            return Err(DataError::NotFound(format!("data set {id}")));
        }

        self.get_data_set_by_id(id)
    }

    /// Hard-removes the data set's records and soft-deletes its document.
    ///
    /// # Errors
    /// [`DataError::Validation`] for missing identifying fields.
    pub fn delete_data_set(&self, data_set: &mut DataSet) -> Result<usize, DataError> {
        self.ensure_open()?;
        require_identifier("data set id", &data_set.id)?;
        require_identifier("data set user_id", &data_set.user_id)?;
        require_identifier("data set upload_id", &data_set.upload_id)?;
        if data_set.deletion == DeletionState::Purged {
            return Err(DataError::Precondition(format!(
                "data set {} is purged",
                data_set.id
            )));
        }

        let removed = self
            .records
            .remove_many(&own_records(data_set))
            .map_err(|err| err.with_operation("unable to remove data set data"))?;

        let now = now_utc();
        if data_set.deletion.is_live() {
            let deleted = self
                .data_sets
                .soft_delete(&data_set.id, now)
                .map_err(|err| err.with_operation("unable to delete data set"))?;
            if !deleted {
                // Already deleted elsewhere; keep the stored deletion time.
                let stored = self
                    .data_sets
                    .get(&data_set.id)
                    .map_err(|err| err.with_operation("unable to delete data set"))?;
                if let Some(stored) = stored.filter(|stored| !stored.deletion.is_live()) {
                    data_set.deletion = stored.deletion;
                }
            }
        }
        data_set.deletion = data_set.deletion.soft_delete(now)?;

        log::debug!(
            "deleted data set {} (upload {}), removed {removed} records",
            data_set.id,
            data_set.upload_id
        );
        Ok(removed)
    }

    /// Hard-removes the data set document, bypassing soft deletion, and marks
    /// it purged. Records are removed only while the stored set is live;
    /// a soft-deleted set already lost them and its upload id may belong to a
    /// newer set.
    ///
    /// # Errors
    /// [`DataError::NotFound`] when no data set has the id;
    /// [`DataError::Validation`] for missing identifying fields.
    pub fn purge_data_set(&self, data_set: &mut DataSet) -> Result<RemovalReport, DataError> {
        self.ensure_open()?;
        require_identifier("data set id", &data_set.id)?;
        require_identifier("data set user_id", &data_set.user_id)?;
        require_identifier("data set upload_id", &data_set.upload_id)?;

        let stored = self
            .data_sets
            .get(&data_set.id)
            .map_err(|err| err.with_operation("unable to purge data set"))?
            .ok_or_else(|| DataError::NotFound(format!("data set {}", data_set.id)))?;

        let records_removed = if stored.deletion.is_live() {
            self.records
                .remove_many(&own_records(&stored))
                .map_err(|err| err.with_operation("unable to remove data set data"))?
        } else {
            0
        };

        let selector = DataSetSelector {
            user_id: Some(stored.user_id.clone()),
            data_set_id: Some(stored.id.clone()),
            include_deleted: true,
            ..DataSetSelector::default()
        };
        let data_sets_removed = self
            .data_sets
            .hard_remove_all(&selector)
            .map_err(|err| err.with_operation("unable to purge data set"))?;

        data_set.deletion = data_set.deletion.purge();
        log::debug!(
            "purged data set {} (upload {}), removed {records_removed} records",
            data_set.id,
            data_set.upload_id
        );
        Ok(RemovalReport {
            records_removed,
            data_sets_removed,
        })
    }

    /// Stamps and bulk-inserts `records` as inactive members of `data_set`.
    ///
    /// # Errors
    /// [`DataError::Validation`] for an invalid data set or record; a single
    /// [`DataError::Store`] when any record fails to insert.
    pub fn create_data_set_data(
        &self,
        data_set: &DataSet,
        records: &mut [Record],
    ) -> Result<(), DataError> {
        self.ensure_open()?;
        data_set.validate()?;
        for record in records.iter() {
            record.validate()?;
        }

        if records.is_empty() {
            return Ok(());
        }

        let now = now_utc();
        for record in records.iter_mut() {
            if record.id.is_empty() {
                record.id = Ulid::new().to_string();
            }
            record.user_id.clone_from(&data_set.user_id);
            record.upload_id.clone_from(&data_set.upload_id);
            if record.device_id.is_empty() {
                record.device_id.clone_from(&data_set.device_id);
            }
            record.state = RecordState::Inactive;
            record.created_time = Some(now);
            record.modified_time = None;
        }

        self.records
            .insert_many(records, true)
            .map_err(|err| err.with_operation("unable to create data set data"))?;

        log::debug!(
            "inserted {} records into upload {}",
            records.len(),
            data_set.upload_id
        );
        Ok(())
    }

    /// Returns one page of the data set's records ordered by measurement time.
    ///
    /// # Errors
    /// [`DataError::Validation`] for an invalid data set or pagination.
    pub fn list_data_set_data(
        &self,
        data_set: &DataSet,
        pagination: &Pagination,
    ) -> Result<Vec<Record>, DataError> {
        self.ensure_open()?;
        data_set.validate()?;
        let options = pagination.find_options(RecordSort::Time)?;

        self.records
            .find(&own_records(data_set), &options)
            .map_err(|err| err.with_operation("unable to list data set data"))
    }

    /// Activates the data set and every record it owns, clearing any archive
    /// marks on those records. Re-running converges on the same state.
    ///
    /// # Errors
    /// [`DataError::NotFound`] when the data set document does not exist.
    pub fn activate_data_set_data(&self, data_set: &mut DataSet) -> Result<usize, DataError> {
        self.ensure_open()?;
        data_set.validate()?;

        let now = now_utc();
        let update = DataSetUpdate {
            active: Some(true),
            ..DataSetUpdate::default()
        };
        let found = self
            .data_sets
            .update(&data_set.id, &update, now)
            .map_err(|err| err.with_operation("unable to activate data set"))?;
        if !found {
            return Err(DataError::NotFound(format!("data set {}", data_set.id)));
        }

        let activated = self
            .records
            .update_many(
                &own_records(data_set),
                &RecordUpdate::to_state(&RecordState::Active, now),
            )
            .map_err(|err| err.with_operation("unable to activate data set data"))?;

        data_set.active = true;
        data_set.modified_time = Some(now);

        log::debug!(
            "activated {activated} records for upload {}",
            data_set.upload_id
        );
        Ok(activated)
    }

    /// Archives every other active record of the same `(user_id, device_id)`
    /// whose hash appears among this data set's records. Returns the number
    /// of records archived.
    ///
    /// # Errors
    /// [`DataError::Validation`] for missing identifying fields.
    pub fn archive_device_data_using_hashes_from_data_set(
        &self,
        data_set: &DataSet,
    ) -> Result<usize, DataError> {
        self.ensure_open()?;
        data_set.validate()?;

        let hashes = self
            .records
            .distinct_values(RecordField::Hash, &own_records(data_set).with_hash())
            .map_err(|err| err.with_operation("unable to get distinct data set hashes"))?;
        if hashes.is_empty() {
            log::debug!(
                "upload {} has no hashes; nothing to archive",
                data_set.upload_id
            );
            return Ok(0);
        }

        let now = now_utc();
        let filter = RecordFilter::for_user(&data_set.user_id)
            .device(&data_set.device_id)
            .upload(IdMatch::IsNot(data_set.upload_id.clone()))
            .active(true)
            .hash_in(hashes);
        let state = RecordState::Archived(ArchiveMark {
            data_set_id: data_set.upload_id.clone(),
            time: now,
        });

        let archived = self
            .records
            .update_many(&filter, &RecordUpdate::to_state(&state, now))
            .map_err(|err| {
                err.with_operation("unable to archive device data using hashes from data set")
            })?;

        log::debug!(
            "upload {} archived {archived} records of device {}",
            data_set.upload_id,
            data_set.device_id
        );
        Ok(archived)
    }

    /// Reverses archival performed by this data set.
    ///
    /// The data set's own records are grouped by their current
    /// `(active, archivedDatasetId, archivedTime)` triple; records it archived
    /// are restored to the triple of the group holding the matching hash.
    /// Inconsistent groups are logged and skipped.
    ///
    /// # Errors
    /// [`DataError::Validation`] for missing identifying fields.
    pub fn unarchive_device_data_using_hashes_from_data_set(
        &self,
        data_set: &DataSet,
    ) -> Result<UnarchiveReport, DataError> {
        self.ensure_open()?;
        data_set.validate()?;

        let groups = self
            .records
            .aggregate_group_by(
                &own_records(data_set).with_hash(),
                &ARCHIVE_STATE_KEYS,
                RecordField::Hash,
            )
            .map_err(|err| err.with_operation("unable to aggregate data set archive states"))?;

        let now = now_utc();
        let mut report = UnarchiveReport::default();
        for group in groups {
            let restore = ArchiveGroup::try_from(group).and_then(|archive_group| {
                archive_group
                    .restore_state()
                    .map(|state| (state, archive_group.hashes))
            });
            let (state, hashes) = match restore {
                Ok(value) => value,
                Err(err) => {
                    log::warn!(
                        "skipping archive group of upload {} (user {}, device {}): {err}",
                        data_set.upload_id,
                        data_set.user_id,
                        data_set.device_id
                    );
                    report.skipped_groups += 1;
                    continue;
                }
            };

            let filter = RecordFilter::for_user(&data_set.user_id)
                .device(&data_set.device_id)
                .archived_by(&data_set.upload_id)
                .hash_in(hashes);
            let restored = self
                .records
                .update_many(&filter, &RecordUpdate::to_state(&state, now))
                .map_err(|err| {
                    err.with_operation("unable to unarchive device data using hashes from data set")
                })?;

            report.restored_records += restored;
            report.applied_groups += 1;
        }

        log::debug!(
            "upload {} restored {} records ({} groups skipped)",
            data_set.upload_id,
            report.restored_records,
            report.skipped_groups
        );
        Ok(report)
    }

    /// Removes all data for the device that belongs to other data sets and
    /// soft-deletes those data sets. The given data set is never touched.
    ///
    /// # Errors
    /// [`DataError::Validation`] for missing identifying fields.
    pub fn delete_other_data_set_data(
        &self,
        data_set: &DataSet,
    ) -> Result<RemovalReport, DataError> {
        self.ensure_open()?;
        data_set.validate()?;

        let others = IdMatch::IsNot(data_set.upload_id.clone());
        let records_removed = self
            .records
            .remove_many(
                &RecordFilter::for_user(&data_set.user_id)
                    .device(&data_set.device_id)
                    .upload(others.clone()),
            )
            .map_err(|err| err.with_operation("unable to remove other data set data"))?;

        let selector = DataSetSelector {
            user_id: Some(data_set.user_id.clone()),
            device_id: Some(data_set.device_id.clone()),
            upload_id: Some(others),
            include_deleted: false,
            ..DataSetSelector::default()
        };
        let data_sets_removed = self
            .data_sets
            .soft_delete_all(&selector, now_utc())
            .map_err(|err| err.with_operation("unable to delete other data sets"))?;

        log::debug!(
            "upload {} replaced device {} history: {records_removed} records, {data_sets_removed} data sets",
            data_set.upload_id,
            data_set.device_id
        );
        Ok(RemovalReport {
            records_removed,
            data_sets_removed,
        })
    }

    /// Hard-removes every record and data set of the user.
    ///
    /// # Errors
    /// [`DataError::Validation`] for an empty user id.
    pub fn destroy_data_for_user_by_id(&self, user_id: &str) -> Result<RemovalReport, DataError> {
        self.ensure_open()?;
        require_identifier("user_id", user_id)?;

        let records_removed = self
            .records
            .remove_many(&RecordFilter::for_user(user_id))
            .map_err(|err| err.with_operation("unable to destroy data for user by id"))?;

        let selector = DataSetSelector {
            user_id: Some(user_id.to_string()),
            include_deleted: true,
            ..DataSetSelector::default()
        };
        let data_sets_removed = self
            .data_sets
            .hard_remove_all(&selector)
            .map_err(|err| err.with_operation("unable to destroy data sets for user by id"))?;

        log::debug!(
            "destroyed user {user_id}: {records_removed} records, {data_sets_removed} data sets"
        );
        Ok(RemovalReport {
            records_removed,
            data_sets_removed,
        })
    }
}

fn own_records(data_set: &DataSet) -> RecordFilter {
    RecordFilter::for_user(&data_set.user_id).upload(IdMatch::Is(data_set.upload_id.clone()))
}
