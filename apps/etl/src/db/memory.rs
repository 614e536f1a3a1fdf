//! In-process receiving store and warehouse.
//!
//! Stands in for [`PostgresStore`](super::PostgresStore) in tests and dry
//! runs without a database. Writes go straight to shared state and record an
//! undo step, so savepoint and run rollback behave like their Postgres
//! counterparts. Row locks are tracked per run; a row locked by another open
//! run is left out of selection (the `SKIP LOCKED` behavior) since an
//! in-process store cannot block.

use super::{
    matches_selection, EncounterUpsert, IdentifierRecord, PresenceAbsenceUpsert, ProcessingLogEntry,
    ReceivingRecord, ReceivingStore, ReceivingTable, RunSession, SampleRecord, Warehouse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct IndividualRow {
    pub id: i64,
    pub identifier: String,
    pub sex: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteRow {
    pub id: i64,
    pub identifier: String,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncounterRow {
    pub id: i64,
    pub encounter: EncounterUpsert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceAbsenceRow {
    pub id: i64,
    pub result: PresenceAbsenceUpsert,
}

#[derive(Default)]
struct MemoryState {
    receiving: BTreeMap<ReceivingTable, BTreeMap<i64, ReceivingRecord>>,
    locked: HashSet<(ReceivingTable, i64)>,
    identifiers: BTreeMap<String, IdentifierRecord>,
    samples: BTreeMap<i64, SampleRecord>,
    individuals: BTreeMap<String, IndividualRow>,
    sites: BTreeMap<String, SiteRow>,
    encounters: BTreeMap<String, EncounterRow>,
    targets: BTreeMap<String, i64>,
    presence_absence: BTreeMap<String, PresenceAbsenceRow>,
    next_id: i64,
}

impl MemoryState {
    /// Sequence shared by every table; like Postgres sequences it is never rolled back.
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

type Undo = Box<dyn FnOnce(&mut MemoryState) + Send>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a barcode in an identifier set and return its UUID.
    pub fn register_identifier(&self, barcode: &str, set_name: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        lock(&self.state).identifiers.insert(
            barcode.to_lowercase(),
            IdentifierRecord {
                uuid,
                barcode: barcode.to_string(),
                set_name: set_name.to_string(),
            },
        );
        uuid
    }

    /// Add a warehouse sample keyed by a sample and/or collection identifier.
    pub fn add_sample(&self, identifier: Option<Uuid>, collection_identifier: Option<Uuid>) -> i64 {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.samples.insert(
            id,
            SampleRecord {
                id,
                identifier: identifier.map(|u| u.to_string()),
                collection_identifier: collection_identifier.map(|u| u.to_string()),
                encounter_id: None,
            },
        );
        id
    }

    pub fn records(&self, table: ReceivingTable) -> Vec<ReceivingRecord> {
        lock(&self.state)
            .receiving
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn samples(&self) -> Vec<SampleRecord> {
        lock(&self.state).samples.values().cloned().collect()
    }

    pub fn individuals(&self) -> Vec<IndividualRow> {
        lock(&self.state).individuals.values().cloned().collect()
    }

    pub fn sites(&self) -> Vec<SiteRow> {
        lock(&self.state).sites.values().cloned().collect()
    }

    pub fn encounters(&self) -> Vec<EncounterRow> {
        lock(&self.state).encounters.values().cloned().collect()
    }

    pub fn presence_absence(&self) -> Vec<PresenceAbsenceRow> {
        lock(&self.state).presence_absence.values().cloned().collect()
    }
}

#[async_trait]
impl ReceivingStore for MemoryStore {
    async fn begin_run(&self, table: ReceivingTable) -> Result<Box<dyn RunSession>> {
        Ok(Box::new(MemoryRun {
            state: Arc::clone(&self.state),
            table,
            locked: Vec::new(),
            undo: Vec::new(),
            savepoints: Vec::new(),
            finished: false,
        }))
    }

    async fn insert_document(&self, table: ReceivingTable, document: Value) -> Result<i64> {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.receiving.entry(table).or_default().insert(
            id,
            ReceivingRecord {
                id,
                document,
                processing_log: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn count_pending(
        &self,
        table: ReceivingTable,
        etl: &str,
        revision: i32,
        filter: Option<&Value>,
    ) -> Result<i64> {
        let state = lock(&self.state);
        let count = state
            .receiving
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.is_pending(etl, revision))
                    .filter(|r| filter.map_or(true, |f| matches_selection(&r.document, f)))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as i64)
    }
}

pub struct MemoryRun {
    state: Arc<Mutex<MemoryState>>,
    table: ReceivingTable,
    locked: Vec<(ReceivingTable, i64)>,
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    finished: bool,
}

impl MemoryRun {
    fn undo_to(&mut self, mark: usize) {
        let mut state = lock(&self.state);
        while self.undo.len() > mark {
            if let Some(step) = self.undo.pop() {
                step(&mut *state);
            }
        }
    }

    fn release_locks(&mut self) {
        let mut state = lock(&self.state);
        for key in self.locked.drain(..) {
            state.locked.remove(&key);
        }
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| Error::Internal(format!("savepoint {name:?} does not exist")))
    }
}

impl Drop for MemoryRun {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_to(0);
            self.release_locks();
        }
    }
}

#[async_trait]
impl RunSession for MemoryRun {
    async fn select_pending(
        &mut self,
        etl: &str,
        revision: i32,
        filter: Option<&Value>,
    ) -> Result<Vec<ReceivingRecord>> {
        let mut state = lock(&self.state);
        let candidates: Vec<ReceivingRecord> = state
            .receiving
            .get(&self.table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.is_pending(etl, revision))
                    .filter(|r| filter.map_or(true, |f| matches_selection(&r.document, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut selected = Vec::with_capacity(candidates.len());
        for record in candidates {
            let key = (self.table, record.id);
            if self.locked.contains(&key) {
                selected.push(record);
            } else if state.locked.insert(key) {
                self.locked.push(key);
                selected.push(record);
            }
        }
        Ok(selected)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push((name.to_string(), self.undo.len()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let index = self.savepoint_index(name)?;
        let mark = self.savepoints[index].1;
        self.undo_to(mark);
        self.savepoints.truncate(index + 1);
        Ok(())
    }

    async fn append_processing_log(&mut self, id: i64, entry: &ProcessingLogEntry) -> Result<()> {
        let value = serde_json::to_value(entry)?;
        let table = self.table;
        let mut state = lock(&self.state);
        let record = state
            .receiving
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| {
                Error::Integrity(format!(
                    "processing log update of {table} record {id} touched 0 rows"
                ))
            })?;
        record.processing_log.push(value);
        drop(state);

        self.undo.push(Box::new(move |state: &mut MemoryState| {
            if let Some(record) = state.receiving.get_mut(&table).and_then(|r| r.get_mut(&id)) {
                record.processing_log.pop();
            }
        }));
        Ok(())
    }

    fn warehouse(&mut self) -> &mut dyn Warehouse {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut run = self;
        run.undo.clear();
        run.release_locks();
        run.finished = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut run = self;
        run.undo_to(0);
        run.release_locks();
        run.finished = true;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for MemoryRun {
    async fn find_identifier(&mut self, barcode: &str) -> Result<Option<IdentifierRecord>> {
        Ok(lock(&self.state)
            .identifiers
            .get(&barcode.to_lowercase())
            .cloned())
    }

    async fn find_sample(&mut self, uuid: &Uuid) -> Result<Option<SampleRecord>> {
        let uuid = uuid.to_string();
        Ok(lock(&self.state)
            .samples
            .values()
            .find(|s| {
                s.identifier.as_deref() == Some(uuid.as_str())
                    || s.collection_identifier.as_deref() == Some(uuid.as_str())
            })
            .cloned())
    }

    async fn upsert_individual(&mut self, identifier: &str, sex: Option<&str>) -> Result<i64> {
        let mut state = lock(&self.state);
        let previous = state.individuals.get(identifier).cloned();
        let id = match &previous {
            Some(row) => row.id,
            None => state.next_id(),
        };
        let sex = sex
            .map(str::to_string)
            .or_else(|| previous.as_ref().and_then(|row| row.sex.clone()));
        state.individuals.insert(
            identifier.to_string(),
            IndividualRow {
                id,
                identifier: identifier.to_string(),
                sex,
            },
        );
        drop(state);

        let key = identifier.to_string();
        self.undo.push(Box::new(move |state: &mut MemoryState| restore(&mut state.individuals, key, previous)));
        Ok(id)
    }

    async fn upsert_site(&mut self, identifier: &str, details: &Value) -> Result<i64> {
        let mut state = lock(&self.state);
        let previous = state.sites.get(identifier).cloned();
        let (id, mut merged) = match &previous {
            Some(row) => (row.id, row.details.clone()),
            None => (state.next_id(), Value::Object(Default::default())),
        };
        if let (Value::Object(merged), Value::Object(new)) = (&mut merged, details) {
            for (k, v) in new {
                merged.insert(k.clone(), v.clone());
            }
        }
        state.sites.insert(
            identifier.to_string(),
            SiteRow {
                id,
                identifier: identifier.to_string(),
                details: merged,
            },
        );
        drop(state);

        let key = identifier.to_string();
        self.undo.push(Box::new(move |state: &mut MemoryState| restore(&mut state.sites, key, previous)));
        Ok(id)
    }

    async fn upsert_encounter(&mut self, encounter: &EncounterUpsert) -> Result<i64> {
        let mut state = lock(&self.state);
        let previous = state.encounters.get(&encounter.identifier).cloned();
        let id = match &previous {
            Some(row) => row.id,
            None => state.next_id(),
        };
        state.encounters.insert(
            encounter.identifier.clone(),
            EncounterRow {
                id,
                encounter: encounter.clone(),
            },
        );
        drop(state);

        let key = encounter.identifier.clone();
        self.undo.push(Box::new(move |state: &mut MemoryState| restore(&mut state.encounters, key, previous)));
        Ok(id)
    }

    async fn update_sample_encounter(&mut self, sample_id: i64, encounter_id: i64) -> Result<()> {
        let mut state = lock(&self.state);
        let sample = state.samples.get_mut(&sample_id).ok_or_else(|| {
            Error::Integrity(format!(
                "linking sample {sample_id} to encounter {encounter_id} touched 0 rows"
            ))
        })?;
        let previous = sample.encounter_id.replace(encounter_id);
        drop(state);

        self.undo.push(Box::new(move |state: &mut MemoryState| {
            if let Some(sample) = state.samples.get_mut(&sample_id) {
                sample.encounter_id = previous;
            }
        }));
        Ok(())
    }

    async fn find_or_create_target(&mut self, identifier: &str) -> Result<i64> {
        let mut state = lock(&self.state);
        if let Some(id) = state.targets.get(identifier) {
            return Ok(*id);
        }
        let id = state.next_id();
        state.targets.insert(identifier.to_string(), id);
        drop(state);

        let key = identifier.to_string();
        self.undo.push(Box::new(move |state: &mut MemoryState| {
            state.targets.remove(&key);
        }));
        Ok(id)
    }

    async fn upsert_presence_absence(&mut self, result: &PresenceAbsenceUpsert) -> Result<i64> {
        let mut state = lock(&self.state);
        let previous = state.presence_absence.get(&result.identifier).cloned();
        let id = match &previous {
            Some(row) => row.id,
            None => state.next_id(),
        };
        state.presence_absence.insert(
            result.identifier.clone(),
            PresenceAbsenceRow {
                id,
                result: result.clone(),
            },
        );
        drop(state);

        let key = result.identifier.clone();
        self.undo
            .push(Box::new(move |state: &mut MemoryState| restore(&mut state.presence_absence, key, previous)));
        Ok(id)
    }

    async fn insert_fhir_bundle(&mut self, bundle: &Value) -> Result<i64> {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.receiving.entry(ReceivingTable::Fhir).or_default().insert(
            id,
            ReceivingRecord {
                id,
                document: bundle.clone(),
                processing_log: Vec::new(),
            },
        );
        drop(state);

        self.undo.push(Box::new(move |state: &mut MemoryState| {
            if let Some(rows) = state.receiving.get_mut(&ReceivingTable::Fhir) {
                rows.remove(&id);
            }
        }));
        Ok(id)
    }
}

fn restore<V>(map: &mut BTreeMap<String, V>, key: String, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}
