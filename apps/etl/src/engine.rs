//! Revision-tagged reconciliation
//!
//! A run opens one transaction over a receiving table, locks every record
//! that has no processing log entry for the routine's `(name, revision)`,
//! and handles the records in ascending id order. Each record gets its own
//! savepoint so a failing record never leaves half of its writes behind.
//!
//! Every handled record is tagged with a log entry in the same savepoint as
//! its warehouse writes, so a record is either written and tagged or neither.

use crate::config::{AbortPolicy, EtlConfig};
use crate::db::{LogStatus, ProcessingLogEntry, ReceivingRecord, ReceivingStore, RunSession};
use crate::routines::{Outcome, Routine};
use crate::Result;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    /// Records rolled back and left pending under [`AbortPolicy::Isolate`].
    pub failed: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} skipped, {} failed",
            self.processed, self.skipped, self.failed
        )
    }
}

enum RecordStatus {
    Processed,
    Skipped,
    Failed,
}

pub struct Reconciler {
    store: Arc<dyn ReceivingStore>,
    policy: AbortPolicy,
    dry_run: bool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReceivingStore>, config: &EtlConfig) -> Self {
        Self {
            store,
            policy: config.abort_policy,
            dry_run: config.dry_run,
        }
    }

    /// Run `routine` over everything pending for its current revision.
    ///
    /// On error the whole run is rolled back and nothing is tagged.
    pub async fn run(&self, routine: &dyn Routine) -> Result<RunSummary> {
        let etl = routine.name();
        let revision = routine.revision();
        let table = routine.table();
        let selection = routine.selection();

        let mut session = self.store.begin_run(table).await?;

        let records = match session.select_pending(&etl, revision, selection.as_ref()).await {
            Ok(records) => records,
            Err(e) => {
                abandon(session).await;
                return Err(e);
            }
        };

        tracing::info!(
            routine = %etl,
            revision,
            table = %table,
            pending = records.len(),
            "Starting reconciliation run"
        );

        let mut summary = RunSummary::default();
        for record in &records {
            let status = self
                .reconcile_record(session.as_mut(), routine, &etl, revision, record)
                .await;
            match status {
                Ok(RecordStatus::Processed) => summary.processed += 1,
                Ok(RecordStatus::Skipped) => summary.skipped += 1,
                Ok(RecordStatus::Failed) => summary.failed += 1,
                Err(e) => {
                    tracing::error!(
                        routine = %etl,
                        revision,
                        record_id = record.id,
                        error = %e,
                        "Aborting run, rolling back"
                    );
                    abandon(session).await;
                    return Err(e);
                }
            }
        }

        if self.dry_run {
            session.rollback().await?;
            tracing::info!(routine = %etl, revision, %summary, "Dry run complete, rolled back");
        } else {
            session.commit().await?;
            tracing::info!(routine = %etl, revision, %summary, "Reconciliation run committed");
        }

        Ok(summary)
    }

    async fn reconcile_record(
        &self,
        session: &mut dyn RunSession,
        routine: &dyn Routine,
        etl: &str,
        revision: i32,
        record: &ReceivingRecord,
    ) -> Result<RecordStatus> {
        let savepoint = format!("record_{}", record.id);
        session.savepoint(&savepoint).await?;

        let outcome = match routine.process(record, session.warehouse()).await {
            Ok(outcome) => outcome,
            Err(error) => {
                session.rollback_to_savepoint(&savepoint).await?;
                if self.policy == AbortPolicy::Isolate && error.is_data_quality() {
                    session.release_savepoint(&savepoint).await?;
                    tracing::error!(
                        routine = %etl,
                        revision,
                        record_id = record.id,
                        error = %error,
                        "Record rolled back and left pending"
                    );
                    return Ok(RecordStatus::Failed);
                }
                return Err(error);
            }
        };

        let (status, reason) = match &outcome {
            Outcome::Processed => (LogStatus::Processed, None),
            Outcome::Skipped(reason) => (LogStatus::Skipped, Some(reason.to_string())),
        };
        let entry = ProcessingLogEntry::new(etl, revision, status, reason);
        session.append_processing_log(record.id, &entry).await?;
        session.release_savepoint(&savepoint).await?;

        match outcome {
            Outcome::Processed => {
                tracing::debug!(routine = %etl, revision, record_id = record.id, "Record processed");
                Ok(RecordStatus::Processed)
            }
            Outcome::Skipped(reason) => {
                tracing::info!(
                    routine = %etl,
                    revision,
                    record_id = record.id,
                    %reason,
                    "Record skipped"
                );
                Ok(RecordStatus::Skipped)
            }
        }
    }

    /// Records still waiting for `routine`'s current revision.
    pub async fn pending(&self, routine: &dyn Routine) -> Result<i64> {
        self.store
            .count_pending(
                routine.table(),
                &routine.name(),
                routine.revision(),
                routine.selection().as_ref(),
            )
            .await
    }
}

async fn abandon(session: Box<dyn RunSession>) {
    if let Err(e) = session.rollback().await {
        tracing::error!(error = %e, "Rollback failed");
    }
}
