//! The event loop: input snapshots in, xDS snapshots and reports out.

use std::collections::BTreeSet;

use gantry_api::{report::Report, ResourceKind};
use tokio_util::sync::CancellationToken;

use crate::admin::LatestInput;
use crate::emitter::EmitterChannels;
use crate::reporter::Reporter;
use crate::settings::Settings;
use crate::snapshot::InputSnapshot;
use crate::translator::Translator;
use crate::xds::{SnapshotCache, XdsSnapshot};

/// Drives translation.
///
/// Every distinct input snapshot is translated once per role, and every
/// Upstream and UpstreamGroup in it is validated once whether or not a role
/// uses it. Reports are written back to storage and the resulting xDS is
/// installed in the cache, unless it depends on rejected configuration. After
/// each snapshot the loop waits for the configured refresh rate, so a burst
/// of changes is coalesced into the latest snapshot instead of being
/// translated one at a time.
pub struct EventLoop {
    translator: Translator,
    reporter: Reporter,
    cache: SnapshotCache,
    latest: LatestInput,
    refresh_rate: std::time::Duration,
    last_hash: Option<u64>,
    roles: BTreeSet<String>,
}

impl EventLoop {
    pub fn new(
        translator: Translator,
        reporter: Reporter,
        cache: SnapshotCache,
        latest: LatestInput,
        settings: &Settings,
    ) -> Self {
        Self {
            translator,
            reporter,
            cache,
            latest,
            refresh_rate: *settings.refresh_rate,
            last_hash: None,
            roles: BTreeSet::new(),
        }
    }

    /// Run until `cancel` fires or the emitter shuts down.
    pub async fn run(mut self, channels: EmitterChannels, cancel: CancellationToken) {
        let EmitterChannels {
            mut snapshots,
            mut errors,
        } = channels;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("event loop stopped");
                    return;
                }
                snapshot = snapshots.recv() => {
                    let Some(snapshot) = snapshot else {
                        tracing::info!("snapshot emitter closed, stopping event loop");
                        return;
                    };

                    if !self.process(snapshot).await {
                        continue;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("event loop stopped");
                            return;
                        }
                        _ = tokio::time::sleep(self.refresh_rate) => (),
                    }
                }
                Some(err) = errors.recv() => {
                    tracing::warn!(err = %err, temporary = err.is_temporary(), "emitter error");
                }
            }
        }
    }

    /// Handle a single snapshot. Returns `false` if the snapshot was skipped
    /// without doing any work.
    async fn process(&mut self, snapshot: InputSnapshot) -> bool {
        let hash = snapshot.hash();
        if self.last_hash == Some(hash) {
            tracing::trace!(hash, "skipping unchanged snapshot");
            return false;
        }
        self.last_hash = Some(hash);

        if !snapshot.is_ready() {
            tracing::debug!(hash, "snapshot is not ready yet");
            return false;
        }

        self.latest.store(snapshot.redacted());
        self.update_xds(&snapshot).await;
        true
    }

    async fn update_xds(&mut self, snapshot: &InputSnapshot) {
        let global_reports = self.translator.validate_upstreams(snapshot);
        if let Err(e) = self.reporter.write_global_reports(global_reports).await {
            tracing::warn!(err = %e, "failed to write reports");
        }

        let roles = snapshot.roles();
        for role in &roles {
            let projected = snapshot.for_role(role);
            let result = self.translator.translate(role, &projected);

            let role_reports: Vec<Report> = result
                .reports
                .into_iter()
                .filter(|r| r.kind == ResourceKind::VirtualService)
                .collect();
            if let Err(e) = self.reporter.write_role_reports(role, role_reports).await {
                tracing::warn!(%role, err = %e, "failed to write role reports");
            }

            if result.invalid_config {
                tracing::warn!(
                    %role,
                    "not updating xds: accepted configuration depends on rejected upstreams",
                );
                continue;
            }

            tracing::info!(%role, "updating xds snapshot");
            self.cache.set_snapshot(role, result.snapshot);
        }

        // roles that lost every VirtualService get an empty snapshot so their
        // proxies tear down stale listeners.
        for role in self.roles.difference(&roles) {
            tracing::info!(%role, "role has no virtual services, clearing xds snapshot");
            self.cache
                .set_snapshot(role, XdsSnapshot::new(vec![], vec![], vec![], vec![]));
        }
        self.roles = roles;
    }
}
