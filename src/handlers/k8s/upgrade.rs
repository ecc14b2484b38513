//! Operator upgrade orchestration
//!
//! Operator upgrades are published by OLM as pending install plans on each
//! DatabaseEngine. An upgrade plan pairs every engine's next target version
//! with a preflight verdict for each database cluster it manages. Approving the
//! plan runs a small state machine:
//!
//! ```text
//! Unlocked --EnginesLocked--> Locked --UpgradeStarted--> Upgrading (done)
//!    |                          |                           |
//!    +--LockFailed---+          +--ClustersNotReady--+      +--ApprovalFailed--+
//!                    v                               v                         v
//!                                  FailedRolledBack
//! ```
//!
//! Every exit into `FailedRolledBack` releases the engine locks this approval
//! acquired. Locks that were already held before the approval are left alone.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::{AppState, DatabaseCluster, DatabaseEngine};
use crate::handlers::{
    Error, PendingTask, RequestContext, Result, Upgrade, UpgradePlan, UpgradeTask,
};
use crate::kubernetes::KubeConnector;
use crate::version;
use crate::version_service::VersionService;

/// The target operator version must be strictly newer than the running one.
pub fn validate_operator_upgrade_version(current: &str, target: &str) -> Result<()> {
    let invalid = || Error::InvalidTargetVersion(target.to_string());
    let target_version = version::parse(target).ok_or_else(invalid)?;
    let current_version = version::parse(current).ok_or_else(invalid)?;
    if target_version <= current_version {
        return Err(invalid());
    }
    Ok(())
}

/// Smallest supported engine version whose major is at least the major of
/// `current`.
pub fn min_supported_version(current: &str, supported: &[String]) -> Result<Option<String>> {
    let current = version::parse(current)
        .ok_or_else(|| Error::Preflight(format!("invalid engine version '{current}'")))?;

    let mut min: Option<(semver::Version, &String)> = None;
    for raw in supported {
        let candidate = version::parse(raw)
            .ok_or_else(|| Error::Preflight(format!("invalid supported version '{raw}'")))?;
        if candidate.major < current.major {
            continue;
        }
        if min.as_ref().is_none_or(|(v, _)| candidate < *v) {
            min = Some((candidate, raw));
        }
    }
    Ok(min.map(|(_, raw)| raw.clone()))
}

/// Verdict for a single cluster ahead of an operator upgrade.
pub fn preflight_cluster(cluster: &DatabaseCluster, supported: &[String]) -> Result<UpgradeTask> {
    let name = cluster.name_any();
    let current = &cluster.spec.engine.version;
    let min = min_supported_version(current, supported)
        .map_err(|e| e.context(format!("failed to check engine version of '{name}'")))?
        .ok_or_else(|| {
            Error::Preflight(format!(
                "no minimum supported version found for {}",
                cluster.engine_type().operator_name()
            ))
        })?;

    if version::compare(current, &min).is_lt() {
        return Ok(UpgradeTask {
            name,
            pending_task: PendingTask::UpgradeEngine,
            message: format!("Upgrade DB version to {min} or higher"),
        });
    }

    if let Some(cr_version) = cluster.recommended_cr_version() {
        return Ok(UpgradeTask {
            name,
            pending_task: PendingTask::Restart,
            message: format!("Update CRVersion to {cr_version}"),
        });
    }

    if cluster.app_state() != AppState::Ready {
        return Ok(UpgradeTask {
            name,
            pending_task: PendingTask::NotReady,
            message: "Database is not ready".to_string(),
        });
    }

    Ok(UpgradeTask::ready(name))
}

/// Residual work for a cluster once no operator upgrade is pending.
pub fn post_upgrade_task(cluster: &DatabaseCluster) -> UpgradeTask {
    match cluster.recommended_cr_version() {
        Some(cr_version) => UpgradeTask {
            name: cluster.name_any(),
            pending_task: PendingTask::Restart,
            message: format!("Database needs restart to use CRVersion '{cr_version}'"),
        },
        None => UpgradeTask::ready(cluster.name_any()),
    }
}

/// Install plans behind every engine's next upgrade, sorted and de-duplicated.
pub fn install_plans_to_approve(engines: &[DatabaseEngine]) -> Vec<String> {
    engines
        .iter()
        .filter_map(|engine| {
            let next = engine.next_upgrade_version()?;
            Some(
                engine
                    .pending_upgrades()
                    .iter()
                    .filter(move |u| u.target_version == next)
                    .map(|u| u.install_plan_ref.name.clone()),
            )
        })
        .flatten()
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Upgrades available in `namespace` and the preflight verdict for each
/// affected cluster. Pending actions are empty when nothing is upgradable.
pub async fn compute_upgrade_plan(
    ctx: &RequestContext,
    kube: &dyn KubeConnector,
    versions: &dyn VersionService,
    namespace: &str,
) -> Result<UpgradePlan> {
    let engines = ctx.run(kube.list_database_engines(namespace)).await?;
    let mut plan = UpgradePlan::default();
    let mut clusters: Option<Vec<DatabaseCluster>> = None;

    for engine in &engines {
        let Some(target) = engine.next_upgrade_version() else {
            continue;
        };
        let engine_type = engine.spec.engine_type;
        validate_operator_upgrade_version(engine.operator_version(), target)?;
        if engine.pending_upgrade(target).is_none() {
            return Err(Error::UpgradeUnavailable);
        }

        plan.upgrades.push(Upgrade {
            name: engine.name_any(),
            current_version: engine.operator_version().to_string(),
            target_version: target.to_string(),
        });

        if clusters.is_none() {
            clusters = Some(ctx.run(kube.list_database_clusters(namespace)).await?);
        }
        let affected: Vec<&DatabaseCluster> = clusters
            .iter()
            .flatten()
            .filter(|c| c.engine_type() == engine_type)
            .collect();
        if affected.is_empty() {
            continue;
        }

        let supported = ctx
            .run(versions.supported_engine_versions(engine_type, target))
            .await
            .map_err(|e| e.context("failed to get supported engine versions"))?;
        let mut tasks = affected
            .into_iter()
            .map(|c| preflight_cluster(c, &supported))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.context("failed to run preflight checks"))?;
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        plan.pending_actions.extend(tasks);
    }

    Ok(plan)
}

/// Residual per-cluster work after an upgrade has completed.
pub async fn compute_post_upgrade_tasks(
    ctx: &RequestContext,
    kube: &dyn KubeConnector,
    namespace: &str,
) -> Result<Vec<UpgradeTask>> {
    let engines = ctx.run(kube.list_database_engines(namespace)).await?;
    if engines.is_empty() {
        return Ok(Vec::new());
    }
    let clusters = ctx.run(kube.list_database_clusters(namespace)).await?;
    Ok(engines
        .iter()
        .flat_map(|engine| {
            clusters
                .iter()
                .filter(|c| c.engine_type() == engine.spec.engine_type)
                .map(post_upgrade_task)
        })
        .collect())
}

/// Side effects the approval workflow performs. Implemented by the execution
/// handler against Kubernetes and by fakes in tests.
#[async_trait]
pub trait UpgradeSteps: Send + Sync {
    /// Lock an engine for upgrade. Returns whether it was already locked.
    async fn lock_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<bool>;
    async fn unlock_engine(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> Result<()>;
    /// Approve the install plans of every engine's next upgrade.
    async fn approve_pending_install_plans(
        &self,
        ctx: &RequestContext,
        namespace: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    Unlocked,
    Locked,
    Upgrading,
    FailedRolledBack,
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalState::Unlocked => write!(f, "Unlocked"),
            ApprovalState::Locked => write!(f, "Locked"),
            ApprovalState::Upgrading => write!(f, "Upgrading"),
            ApprovalState::FailedRolledBack => write!(f, "FailedRolledBack"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalEvent {
    EnginesLocked,
    LockFailed,
    ClustersNotReady,
    UpgradeStarted,
    ApprovalFailed,
}

const TRANSITIONS: &[(ApprovalState, ApprovalEvent, ApprovalState)] = &[
    (ApprovalState::Unlocked, ApprovalEvent::EnginesLocked, ApprovalState::Locked),
    (ApprovalState::Unlocked, ApprovalEvent::LockFailed, ApprovalState::FailedRolledBack),
    (ApprovalState::Locked, ApprovalEvent::ClustersNotReady, ApprovalState::FailedRolledBack),
    (ApprovalState::Locked, ApprovalEvent::UpgradeStarted, ApprovalState::Upgrading),
    (ApprovalState::Upgrading, ApprovalEvent::ApprovalFailed, ApprovalState::FailedRolledBack),
];

impl ApprovalState {
    /// Next state for `event`, or `None` if the event is invalid here.
    pub fn on(self, event: ApprovalEvent) -> Option<ApprovalState> {
        TRANSITIONS
            .iter()
            .find(|(from, ev, _)| *from == self && *ev == event)
            .map(|(_, _, to)| *to)
    }
}

/// One run of the approval workflow for a namespace.
pub struct UpgradeApproval<'a> {
    steps: &'a dyn UpgradeSteps,
    namespace: &'a str,
    state: ApprovalState,
    acquired: Vec<String>,
}

impl<'a> UpgradeApproval<'a> {
    pub fn new(steps: &'a dyn UpgradeSteps, namespace: &'a str) -> Self {
        Self {
            steps,
            namespace,
            state: ApprovalState::Unlocked,
            acquired: Vec::new(),
        }
    }

    pub fn state(&self) -> ApprovalState {
        self.state
    }

    /// Engines this run locked and has not yet released.
    pub fn acquired_locks(&self) -> &[String] {
        &self.acquired
    }

    fn advance(&mut self, event: ApprovalEvent) {
        match self.state.on(event) {
            Some(next) => {
                info!(
                    namespace = %self.namespace,
                    from = %self.state,
                    to = %next,
                    ?event,
                    "Upgrade approval transition"
                );
                self.state = next;
            }
            None => warn!(
                namespace = %self.namespace,
                state = %self.state,
                ?event,
                "Ignoring invalid upgrade approval transition"
            ),
        }
    }

    pub async fn run(mut self, ctx: &RequestContext, plan: &UpgradePlan) -> Result<ApprovalState> {
        for upgrade in &plan.upgrades {
            match self.steps.lock_engine(ctx, self.namespace, &upgrade.name).await {
                Ok(false) => self.acquired.push(upgrade.name.clone()),
                Ok(true) => {}
                Err(e) => {
                    let e = e.context(format!("failed to lock engine '{}'", upgrade.name));
                    return self.roll_back(ctx, ApprovalEvent::LockFailed, e).await;
                }
            }
        }
        self.advance(ApprovalEvent::EnginesLocked);

        if let Some(task) = plan
            .pending_actions
            .iter()
            .find(|t| t.pending_task != PendingTask::Ready)
        {
            info!(
                namespace = %self.namespace,
                cluster = %task.name,
                pending_task = ?task.pending_task,
                "Database cluster not ready for operator upgrade"
            );
            return self
                .roll_back(ctx, ApprovalEvent::ClustersNotReady, Error::ClustersNotReady)
                .await;
        }

        self.advance(ApprovalEvent::UpgradeStarted);
        if let Err(e) = self
            .steps
            .approve_pending_install_plans(ctx, self.namespace)
            .await
        {
            return self.roll_back(ctx, ApprovalEvent::ApprovalFailed, e).await;
        }

        info!(
            namespace = %self.namespace,
            engines = plan.upgrades.len(),
            "Operator upgrade approved"
        );
        Ok(self.state)
    }

    /// Release acquired locks, then fail with `error`. A failed release is
    /// reported alongside the original error.
    async fn roll_back(
        &mut self,
        ctx: &RequestContext,
        event: ApprovalEvent,
        error: Error,
    ) -> Result<ApprovalState> {
        let mut release_error = None;
        for name in std::mem::take(&mut self.acquired) {
            if let Err(e) = self.steps.unlock_engine(ctx, self.namespace, &name).await {
                warn!(
                    namespace = %self.namespace,
                    engine = %name,
                    error = %e,
                    "Failed to release upgrade lock"
                );
                self.acquired.push(name);
                release_error.get_or_insert(e);
            }
        }
        self.advance(event);

        match release_error {
            Some(release) => Err(Error::Compensation {
                error: Box::new(error),
                release: Box::new(release),
            }),
            None => Err(error),
        }
    }
}
