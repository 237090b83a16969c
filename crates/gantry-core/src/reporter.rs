//! Writes translation reports back to storage.

use std::sync::Arc;

use gantry_api::report::Report;

use crate::error::StorageError;
use crate::storage::ResourceClient;

/// Persists [Report]s so users can see why their configuration was or wasn't
/// accepted.
///
/// Writes are idempotent. A report whose content already matches what's
/// stored is left alone, so re-reporting an unchanged translation doesn't
/// touch storage.
#[derive(Clone)]
pub struct Reporter {
    reports: Arc<dyn ResourceClient<Report>>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}

impl Reporter {
    pub fn new(reports: Arc<dyn ResourceClient<Report>>) -> Self {
        Self { reports }
    }

    /// Write reports that aren't qualified by a role.
    pub async fn write_global_reports(&self, reports: Vec<Report>) -> Result<(), StorageError> {
        self.write_all(reports).await
    }

    /// Write reports for a single role. Each report is stored as
    /// `<role>-<object-name>`.
    pub async fn write_role_reports(
        &self,
        role: &str,
        reports: Vec<Report>,
    ) -> Result<(), StorageError> {
        self.write_all(reports.into_iter().map(|r| r.for_role(role)).collect())
            .await
    }

    /// Write every report, logging failures as they happen. Every report is
    /// attempted even if an earlier one failed. Returns the first error.
    async fn write_all(&self, reports: Vec<Report>) -> Result<(), StorageError> {
        let mut first_err = None;

        for report in reports {
            let name = report.metadata.name.clone();
            let namespace = report.metadata.namespace.clone();

            if let Err(e) = self.write(report).await {
                tracing::warn!(%namespace, %name, err = %e, "failed to write report");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn write(&self, mut report: Report) -> Result<(), StorageError> {
        let existing = self
            .reports
            .get(&report.metadata.namespace, &report.metadata.name)
            .await;

        match existing {
            Ok(existing) if existing.same_content(&report) => Ok(()),
            Ok(existing) => {
                report
                    .metadata
                    .resource_version
                    .clone_from(&existing.metadata.resource_version);
                tracing::debug!(
                    namespace = report.metadata.namespace,
                    name = report.metadata.name,
                    rejected = report.is_rejected(),
                    "updating report",
                );
                self.reports.update(report).await.map(|_| ())
            }
            Err(StorageError::NotFound { .. }) => {
                tracing::debug!(
                    namespace = report.metadata.namespace,
                    name = report.metadata.name,
                    rejected = report.is_rejected(),
                    "creating report",
                );
                self.reports.create(report).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}
