//! PostgreSQL-backed receiving store and warehouse
//!
//! Uses runtime queries; table names are only ever formatted in from
//! [`ReceivingTable::qualified_name`].

use super::{
    EncounterUpsert, IdentifierRecord, PresenceAbsenceUpsert, ProcessingLogEntry,
    ReceivingRecord, ReceivingStore, ReceivingTable, RunSession, SampleRecord, Warehouse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    skip_locked: bool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            skip_locked: false,
        }
    }

    /// Let concurrent runs skip rows another run has locked instead of waiting.
    pub fn with_skip_locked(mut self, skip_locked: bool) -> Self {
        self.skip_locked = skip_locked;
        self
    }
}

#[async_trait]
impl ReceivingStore for PostgresStore {
    async fn begin_run(&self, table: ReceivingTable) -> Result<Box<dyn RunSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresRun {
            tx,
            table,
            skip_locked: self.skip_locked,
        }))
    }

    async fn insert_document(&self, table: ReceivingTable, document: Value) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (document) VALUES ($1) RETURNING id",
            table.qualified_name()
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .bind(document)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn count_pending(
        &self,
        table: ReceivingTable,
        etl: &str,
        revision: i32,
        filter: Option<&Value>,
    ) -> Result<i64> {
        let sql = format!(
            "SELECT count(*) FROM {} \
             WHERE NOT processing_log @> $1::jsonb \
               AND ($2::jsonb IS NULL OR NOT EXISTS ( \
                   SELECT 1 FROM jsonb_each_text($2::jsonb) AS wanted(key, value) \
                    WHERE (document ->> wanted.key) IS DISTINCT FROM wanted.value))",
            table.qualified_name()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(json!([ProcessingLogEntry::marker(etl, revision)]))
            .bind(filter.cloned())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

pub struct PostgresRun {
    tx: Transaction<'static, Postgres>,
    table: ReceivingTable,
    skip_locked: bool,
}

#[async_trait]
impl RunSession for PostgresRun {
    async fn select_pending(
        &mut self,
        etl: &str,
        revision: i32,
        filter: Option<&Value>,
    ) -> Result<Vec<ReceivingRecord>> {
        let sql = format!(
            r#"
            SELECT id, document, processing_log
              FROM {}
             WHERE NOT processing_log @> $1::jsonb
               AND ($2::jsonb IS NULL OR NOT EXISTS (
                   SELECT 1 FROM jsonb_each_text($2::jsonb) AS wanted(key, value)
                    WHERE (document ->> wanted.key) IS DISTINCT FROM wanted.value))
             ORDER BY id
               FOR UPDATE{}
            "#,
            self.table.qualified_name(),
            if self.skip_locked { " SKIP LOCKED" } else { "" }
        );

        let rows = sqlx::query(&sql)
            .bind(json!([ProcessingLogEntry::marker(etl, revision)]))
            .bind(filter.cloned())
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter()
            .map(|row| {
                let processing_log = match row.try_get::<Value, _>("processing_log")? {
                    Value::Array(entries) => entries,
                    other => {
                        return Err(Error::Integrity(format!(
                            "processing_log of {} is not an array: {}",
                            self.table, other
                        )))
                    }
                };
                Ok(ReceivingRecord {
                    id: row.try_get("id")?,
                    document: row.try_get("document")?,
                    processing_log,
                })
            })
            .collect()
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("SAVEPOINT \"{name}\""))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT \"{name}\""))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT \"{name}\""))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn append_processing_log(&mut self, id: i64, entry: &ProcessingLogEntry) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET processing_log = processing_log || $2::jsonb WHERE id = $1",
            self.table.qualified_name()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(json!([entry]))
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() != 1 {
            return Err(Error::Integrity(format!(
                "processing log update of {} record {} touched {} rows",
                self.table,
                id,
                result.rows_affected()
            )));
        }
        Ok(())
    }

    fn warehouse(&mut self) -> &mut dyn Warehouse {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PostgresRun {
    async fn find_identifier(&mut self, barcode: &str) -> Result<Option<IdentifierRecord>> {
        let row = sqlx::query(
            r#"
            SELECT identifier.uuid, identifier.barcode, identifier_set.name AS set_name
              FROM warehouse.identifier
              JOIN warehouse.identifier_set USING (identifier_set_id)
             WHERE lower(identifier.barcode) = lower($1)
            "#,
        )
        .bind(barcode)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|row| {
            Ok(IdentifierRecord {
                uuid: row.try_get("uuid")?,
                barcode: row.try_get("barcode")?,
                set_name: row.try_get("set_name")?,
            })
        })
        .transpose()
    }

    async fn find_sample(&mut self, uuid: &Uuid) -> Result<Option<SampleRecord>> {
        let row = sqlx::query(
            r#"
            SELECT sample_id, identifier, collection_identifier, encounter_id
              FROM warehouse.sample
             WHERE identifier = $1 OR collection_identifier = $1
               FOR UPDATE
            "#,
        )
        .bind(uuid.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|row| {
            Ok(SampleRecord {
                id: row.try_get("sample_id")?,
                identifier: row.try_get("identifier")?,
                collection_identifier: row.try_get("collection_identifier")?,
                encounter_id: row.try_get("encounter_id")?,
            })
        })
        .transpose()
    }

    async fn upsert_individual(&mut self, identifier: &str, sex: Option<&str>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO warehouse.individual (identifier, sex)
            VALUES ($1, $2)
            ON CONFLICT (identifier) DO UPDATE
               SET sex = COALESCE(EXCLUDED.sex, warehouse.individual.sex)
            RETURNING individual_id
            "#,
        )
        .bind(identifier)
        .bind(sex)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_site(&mut self, identifier: &str, details: &Value) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO warehouse.site (identifier, details)
            VALUES ($1, $2)
            ON CONFLICT (identifier) DO UPDATE
               SET details = warehouse.site.details || EXCLUDED.details
            RETURNING site_id
            "#,
        )
        .bind(identifier)
        .bind(details)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_encounter(&mut self, encounter: &EncounterUpsert) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO warehouse.encounter
                (identifier, individual_id, site_id, encountered, age, details)
            VALUES ($1, $2, $3, $4, $5::double precision * interval '1 year', $6)
            ON CONFLICT (identifier) DO UPDATE
               SET individual_id = EXCLUDED.individual_id,
                   site_id       = EXCLUDED.site_id,
                   encountered   = EXCLUDED.encountered,
                   age           = EXCLUDED.age,
                   details       = EXCLUDED.details
            RETURNING encounter_id
            "#,
        )
        .bind(&encounter.identifier)
        .bind(encounter.individual_id)
        .bind(encounter.site_id)
        .bind(encounter.encountered)
        .bind(encounter.age)
        .bind(&encounter.details)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn update_sample_encounter(&mut self, sample_id: i64, encounter_id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE warehouse.sample SET encounter_id = $2 WHERE sample_id = $1")
                .bind(sample_id)
                .bind(encounter_id)
                .execute(&mut *self.tx)
                .await?;

        if result.rows_affected() != 1 {
            return Err(Error::Integrity(format!(
                "linking sample {} to encounter {} touched {} rows",
                sample_id,
                encounter_id,
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn find_or_create_target(&mut self, identifier: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO warehouse.target (identifier)
            VALUES ($1)
            ON CONFLICT (identifier) DO UPDATE SET identifier = EXCLUDED.identifier
            RETURNING target_id
            "#,
        )
        .bind(identifier)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_presence_absence(&mut self, result: &PresenceAbsenceUpsert) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO warehouse.presence_absence
                (identifier, sample_id, target_id, present, details)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (identifier) DO UPDATE
               SET sample_id = EXCLUDED.sample_id,
                   target_id = EXCLUDED.target_id,
                   present   = EXCLUDED.present,
                   details   = EXCLUDED.details
            RETURNING presence_absence_id
            "#,
        )
        .bind(&result.identifier)
        .bind(result.sample_id)
        .bind(result.target_id)
        .bind(result.present)
        .bind(&result.details)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_fhir_bundle(&mut self, bundle: &Value) -> Result<i64> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO receiving.fhir (document) VALUES ($1) RETURNING id")
                .bind(bundle)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(id)
    }
}
