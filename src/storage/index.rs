use crate::core::error::{Error, Result};
use crate::core::model::{
    CodeElementRecord, ElementKind, LogicalIdRecords, MarkupElementRecord, RefreshScope,
    TableCounts, SEP,
};
use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::Path;

/// Code records keyed by `file SEP kind SEP id [SEP start]`, JSON values
const CODE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("element_code");
/// Markup records keyed by `file SEP tag SEP id SEP variant`, JSON values
const MARKUP_TABLE: TableDefinition<&str, &str> = TableDefinition::new("element_markup");
/// Digest hex keyed by file path
const DIGEST_TABLE: TableDefinition<&str, &str> = TableDefinition::new("file_digest");

fn db<E: Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Database(format!("{}: {}", context, e))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(db("Failed to serialize record"))
}

fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(db("Failed to deserialize record"))
}

/// Owning file, first key component
fn key_file(key: &str) -> &str {
    key.split(SEP).next().unwrap_or_default()
}

/// Element kind or tag, second key component
fn key_kind(key: &str) -> &str {
    key.split(SEP).nth(1).unwrap_or_default()
}

/// Logical id, third key component
fn key_logical_id(key: &str) -> &str {
    key.split(SEP).nth(2).unwrap_or_default()
}

fn file_prefix(file_path: &str) -> String {
    format!("{}{}", file_path, SEP)
}

/// Persistent index over element records and file digests.
///
/// Every public mutation runs in exactly one write transaction, so a call either
/// commits all of its rows or none.
pub struct IndexStore {
    db: Database,
}

impl IndexStore {
    /// Open or create the store, creating all tables if absent
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database = if path.exists() {
            Database::open(path).map_err(|e| {
                let msg = e.to_string();
                if msg.to_lowercase().contains("lock") || msg.contains("already open") {
                    Error::Database(
                        "Index store is locked. Another mapperlink process may be using this project."
                            .to_string(),
                    )
                } else {
                    Error::Database(format!("Failed to open index store: {}", e))
                }
            })?
        } else {
            Database::create(path).map_err(db("Failed to create index store"))?
        };

        let write_txn = database
            .begin_write()
            .map_err(db("Failed to begin write transaction"))?;
        {
            write_txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
            write_txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
            write_txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
        }
        write_txn.commit().map_err(db("Failed to commit transaction"))?;

        Ok(Self { db: database })
    }

    /// Upsert code records in one transaction
    pub fn batch_upsert_code(&self, records: &[CodeElementRecord]) -> Result<usize> {
        self.write(|txn| {
            let mut table = txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
            upsert_code(&mut table, records)
        })
    }

    /// Upsert markup records in one transaction
    pub fn batch_upsert_markup(&self, records: &[MarkupElementRecord]) -> Result<usize> {
        self.write(|txn| {
            let mut table = txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
            upsert_markup(&mut table, records)
        })
    }

    /// Upsert digests in one transaction
    pub fn batch_upsert_digests(&self, digests: &BTreeMap<String, String>) -> Result<usize> {
        self.write(|txn| {
            let mut table = txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
            upsert_digests(&mut table, digests)
        })
    }

    /// Upsert records and digests together in one transaction
    pub fn commit_batch(
        &self,
        code: &[CodeElementRecord],
        markup: &[MarkupElementRecord],
        digests: &BTreeMap<String, String>,
    ) -> Result<usize> {
        self.write(|txn| {
            let mut written = 0;
            {
                let mut table = txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
                written += upsert_code(&mut table, code)?;
            }
            {
                let mut table = txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
                written += upsert_markup(&mut table, markup)?;
            }
            {
                let mut table = txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
                upsert_digests(&mut table, digests)?;
            }
            Ok(written)
        })
    }

    /// Replace everything `file_path` owns with the given records and digest,
    /// atomically. Returns the number of records written.
    pub fn commit_file(
        &self,
        file_path: &str,
        code: &[CodeElementRecord],
        markup: &[MarkupElementRecord],
        digest: &str,
    ) -> Result<usize> {
        if let Some(foreign) = code
            .iter()
            .map(|r| r.file_path.as_str())
            .chain(markup.iter().map(|r| r.file_path.as_str()))
            .find(|owner| *owner != file_path)
        {
            return Err(Error::Database(format!(
                "record owned by {} committed as part of {}",
                foreign, file_path
            )));
        }

        self.write(|txn| {
            let prefix = file_prefix(file_path);
            let mut written = 0;
            {
                let mut table = txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
                remove_matching(&mut table, |key| key.starts_with(&prefix))?;
                written += upsert_code(&mut table, code)?;
            }
            {
                let mut table = txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
                remove_matching(&mut table, |key| key.starts_with(&prefix))?;
                written += upsert_markup(&mut table, markup)?;
            }
            {
                let mut table = txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
                table
                    .insert(file_path, digest)
                    .map_err(db("Failed to insert digest"))?;
            }
            Ok(written)
        })
    }

    /// All records, from both sides, under `logical_id`
    pub fn query_by_logical_id(&self, logical_id: &str) -> Result<LogicalIdRecords> {
        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        let mut records = LogicalIdRecords::default();

        let table = read_txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
        for item in table.iter().map_err(db("Failed to iterate code table"))? {
            let (key, value) = item.map_err(db("Failed to read code record"))?;
            if key_logical_id(key.value()) == logical_id {
                records.code.push(from_json(value.value())?);
            }
        }

        let table = read_txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
        for item in table.iter().map_err(db("Failed to iterate markup table"))? {
            let (key, value) = item.map_err(db("Failed to read markup record"))?;
            if key_logical_id(key.value()) == logical_id {
                records.markup.push(from_json(value.value())?);
            }
        }

        records.code.sort();
        records.markup.sort();
        Ok(records)
    }

    /// Logical ids of every record owned by `file_path`
    pub fn query_logical_ids_by_file(&self, file_path: &str) -> Result<BTreeSet<String>> {
        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        let prefix = file_prefix(file_path);
        let mut ids = BTreeSet::new();

        for definition in [CODE_TABLE, MARKUP_TABLE] {
            let table = read_txn.open_table(definition).map_err(db("Failed to open table"))?;
            for item in table.iter().map_err(db("Failed to iterate table"))? {
                let (key, _value) = item.map_err(db("Failed to read table item"))?;
                let key = key.value();
                if key.starts_with(&prefix) {
                    ids.insert(key_logical_id(key).to_string());
                }
            }
        }

        Ok(ids)
    }

    /// Files owning at least one record under any of `logical_ids`
    pub fn find_files_by_logical_ids(
        &self,
        logical_ids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let mut files = BTreeSet::new();
        if logical_ids.is_empty() {
            return Ok(files);
        }

        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        for definition in [CODE_TABLE, MARKUP_TABLE] {
            let table = read_txn.open_table(definition).map_err(db("Failed to open table"))?;
            for item in table.iter().map_err(db("Failed to iterate table"))? {
                let (key, _value) = item.map_err(db("Failed to read table item"))?;
                let key = key.value();
                if logical_ids.contains(key_logical_id(key)) {
                    files.insert(key_file(key).to_string());
                }
            }
        }

        Ok(files)
    }

    /// Remove every record owned by `file_path` together with its digest
    pub fn delete_by_file(&self, file_path: &str) -> Result<usize> {
        let prefix = file_prefix(file_path);
        self.write(|txn| {
            let mut removed = 0;
            for definition in [CODE_TABLE, MARKUP_TABLE] {
                let mut table = txn.open_table(definition).map_err(db("Failed to open table"))?;
                removed += remove_matching(&mut table, |key| key.starts_with(&prefix))?;
            }
            let mut digests = txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
            digests
                .remove(file_path)
                .map_err(db("Failed to remove digest"))?;
            Ok(removed)
        })
    }

    /// Remove code and markup records under any of `logical_ids`
    pub fn delete_by_logical_ids(&self, logical_ids: &BTreeSet<String>) -> Result<usize> {
        if logical_ids.is_empty() {
            return Ok(0);
        }
        self.write(|txn| {
            let mut removed = 0;
            for definition in [CODE_TABLE, MARKUP_TABLE] {
                let mut table = txn.open_table(definition).map_err(db("Failed to open table"))?;
                removed +=
                    remove_matching(&mut table, |key| logical_ids.contains(key_logical_id(key)))?;
            }
            Ok(removed)
        })
    }

    /// Empty all three tables
    pub fn clear_all(&self) -> Result<()> {
        self.write(|txn| {
            for definition in [CODE_TABLE, MARKUP_TABLE, DIGEST_TABLE] {
                let mut table = txn.open_table(definition).map_err(db("Failed to open table"))?;
                remove_matching(&mut table, |_| true)?;
            }
            Ok(())
        })
    }

    /// Remove the records a refresh of `scope` rebuilds.
    ///
    /// Digests are only dropped by `All`; a partial scope keeps the other
    /// side's digests valid.
    pub fn clear_scope(&self, scope: RefreshScope) -> Result<usize> {
        if scope == RefreshScope::All {
            let counts = self.counts_by_table()?;
            self.clear_all()?;
            return Ok((counts.code + counts.markup) as usize);
        }

        let usage = ElementKind::Usage.as_str();
        self.write(|txn| match scope {
            RefreshScope::Markup => {
                let mut table = txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
                remove_matching(&mut table, |_| true)
            }
            RefreshScope::Code => {
                let mut table = txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
                remove_matching(&mut table, |key| key_kind(key) != usage)
            }
            RefreshScope::Usage => {
                let mut table = txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
                remove_matching(&mut table, |key| key_kind(key) == usage)
            }
            RefreshScope::All => Ok(0),
        })
    }

    /// Row counts per table plus the number of usage records
    pub fn counts_by_table(&self) -> Result<TableCounts> {
        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        let usage = ElementKind::Usage.as_str();
        let mut counts = TableCounts::default();

        let code = read_txn.open_table(CODE_TABLE).map_err(db("Failed to open code table"))?;
        for item in code.iter().map_err(db("Failed to iterate code table"))? {
            let (key, _value) = item.map_err(db("Failed to read code record"))?;
            counts.code += 1;
            if key_kind(key.value()) == usage {
                counts.usages += 1;
            }
        }

        let markup = read_txn.open_table(MARKUP_TABLE).map_err(db("Failed to open markup table"))?;
        counts.markup = markup.len().map_err(db("Failed to count markup table"))?;

        let digests = read_txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
        counts.digests = digests.len().map_err(db("Failed to count digest table"))?;

        Ok(counts)
    }

    /// Every stored digest keyed by file path
    pub fn all_digests(&self) -> Result<BTreeMap<String, String>> {
        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        let table = read_txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;

        let mut digests = BTreeMap::new();
        for item in table.iter().map_err(db("Failed to iterate digest table"))? {
            let (key, value) = item.map_err(db("Failed to read digest"))?;
            digests.insert(key.value().to_string(), value.value().to_string());
        }
        Ok(digests)
    }

    pub fn digest_for(&self, file_path: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        let table = read_txn.open_table(DIGEST_TABLE).map_err(db("Failed to open digest table"))?;
        let digest = table
            .get(file_path)
            .map_err(db("Failed to get digest"))?
            .map(|guard| guard.value().to_string());
        Ok(digest)
    }

    /// Code records owned by `file_path`, ordered by offset
    pub fn code_records_for_file(&self, file_path: &str) -> Result<Vec<CodeElementRecord>> {
        self.records_for_file(CODE_TABLE, file_path)
    }

    /// Markup records owned by `file_path`, ordered by offset
    pub fn markup_records_for_file(&self, file_path: &str) -> Result<Vec<MarkupElementRecord>> {
        self.records_for_file(MARKUP_TABLE, file_path)
    }

    fn records_for_file<T: DeserializeOwned + Ord>(
        &self,
        definition: TableDefinition<&'static str, &'static str>,
        file_path: &str,
    ) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().map_err(db("Failed to begin read transaction"))?;
        let table = read_txn.open_table(definition).map_err(db("Failed to open table"))?;
        let prefix = file_prefix(file_path);

        let mut records = Vec::new();
        for item in table.iter().map_err(db("Failed to iterate table"))? {
            let (key, value) = item.map_err(db("Failed to read table item"))?;
            if key.value().starts_with(&prefix) {
                records.push(from_json::<T>(value.value())?);
            }
        }
        records.sort();
        Ok(records)
    }

    /// Run `f` in one write transaction, committing only if it succeeds
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let write_txn = self.db.begin_write().map_err(db("Failed to begin write transaction"))?;
        match f(&write_txn) {
            Ok(value) => {
                write_txn.commit().map_err(db("Failed to commit transaction"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = write_txn.abort() {
                    tracing::warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }
}

fn upsert_code(table: &mut Table<&'static str, &'static str>, records: &[CodeElementRecord]) -> Result<usize> {
    for record in records {
        let json = to_json(record)?;
        table
            .insert(record.store_key().as_str(), json.as_str())
            .map_err(db("Failed to insert code record"))?;
    }
    Ok(records.len())
}

fn upsert_markup(table: &mut Table<&'static str, &'static str>, records: &[MarkupElementRecord]) -> Result<usize> {
    for record in records {
        let json = to_json(record)?;
        table
            .insert(record.store_key().as_str(), json.as_str())
            .map_err(db("Failed to insert markup record"))?;
    }
    Ok(records.len())
}

fn upsert_digests(table: &mut Table<&'static str, &'static str>, digests: &BTreeMap<String, String>) -> Result<usize> {
    for (path, digest) in digests {
        table
            .insert(path.as_str(), digest.as_str())
            .map_err(db("Failed to insert digest"))?;
    }
    Ok(digests.len())
}

/// Remove every key accepted by `predicate`; keys are collected first so the
/// iterator's borrow ends before removal.
fn remove_matching(
    table: &mut Table<&'static str, &'static str>,
    predicate: impl Fn(&str) -> bool,
) -> Result<usize> {
    let mut doomed = Vec::new();
    for item in table.iter().map_err(db("Failed to iterate table"))? {
        let (key, _value) = item.map_err(db("Failed to read table item"))?;
        if predicate(key.value()) {
            doomed.push(key.value().to_string());
        }
    }

    for key in &doomed {
        table.remove(key.as_str()).map_err(db("Failed to remove table item"))?;
    }
    Ok(doomed.len())
}
