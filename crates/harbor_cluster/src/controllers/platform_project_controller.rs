//! Keeps a remote Harbor project, its quota and its members in line with a [`PlatformProject`].

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use futures::{future::ready, StreamExt};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event as Finalizer},
    },
    Resource, ResourceExt,
};
use serde::Serialize;
use tracing::*;

use super::{class_filtered, ensure_crd, matches_class, merge_conditions, namespaced_api, object_key, Context};
use crate::api::v1alpha1::*;
use crate::api::{Condition, StatusPhase, READY_CONDITION};
use crate::apply::checksum::fingerprint;
use crate::harbor_client::{HarborClient, MemberGroup, MemberUser, Project, ProjectMember, ProjectMemberReq, ProjectReq};
use crate::util::errors::{Error, Result, StdError};
use crate::util::status::patch_status;

const CONTROLLER: &str = "platformproject";

/// Role IDs of the Harbor v2 API.
const ROLES: [(&str, i64); 4] = [("projectAdmin", 1), ("developer", 2), ("guest", 3), ("maintainer", 4)];

pub fn role_id(role: &str) -> Result<i64> {
    ROLES
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, id)| *id)
        .ok_or_else(|| StdError::InvalidArgument(format!("unknown project role '{role}'")).into())
}

/// Calls needed to turn the current membership into the desired one.
#[derive(Debug, Default, PartialEq)]
pub struct MemberPlan {
    /// Member ID and its new role.
    pub update: Vec<(i64, i64)>,
    pub delete: Vec<i64>,
    pub create: Vec<ProjectMemberReq>,
}

impl MemberPlan {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty() && self.create.is_empty()
    }
}

fn member_request(member: &ProjectMemberSpec, role_id: i64) -> ProjectMemberReq {
    match member.kind {
        MemberKind::User => ProjectMemberReq {
            role_id,
            member_user: Some(MemberUser {
                username: member.name.clone(),
            }),
            member_group: None,
        },
        MemberKind::Group => ProjectMemberReq {
            role_id,
            member_user: None,
            member_group: Some(MemberGroup {
                group_name: member.name.clone(),
            }),
        },
    }
}

/// Walks both memberships sorted by name to find the updates, deletions and creations.
pub fn plan_members(current: &[ProjectMember], desired: &[ProjectMemberSpec]) -> Result<MemberPlan> {
    let mut current: Vec<&ProjectMember> = current.iter().collect();
    current.sort_by(|a, b| a.entity_name.cmp(&b.entity_name));
    let mut desired = desired
        .iter()
        .map(|m| Ok((m, role_id(&m.role)?)))
        .collect::<Result<Vec<_>>>()?;
    desired.sort_by(|a, b| a.0.name.cmp(&b.0.name));

    let mut plan = MemberPlan::default();
    let (mut i, mut j) = (0, 0);
    while i < current.len() || j < desired.len() {
        let order = match (current.get(i), desired.get(j)) {
            (Some(c), Some((d, _))) => c.entity_name.cmp(&d.name),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };
        match order {
            Ordering::Equal => {
                let (member, role) = (current[i], desired[j].1);
                if member.role_id != role {
                    plan.update.push((member.id, role));
                }
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                plan.delete.push(current[i].id);
                i += 1;
            }
            Ordering::Greater => {
                let (member, role) = desired[j];
                plan.create.push(member_request(member, role));
                j += 1;
            }
        }
    }
    Ok(plan)
}

#[derive(Serialize)]
struct Membership<'a> {
    current: &'a [ProjectMember],
    desired: &'a [ProjectMemberSpec],
}

fn members_hash(current: &[ProjectMember], desired: &[ProjectMemberSpec]) -> Result<String> {
    fingerprint(&Membership { current, desired })
}

/// Whether the remote project differs from what the spec asks for.
fn project_drifted(project: &Project, spec: &PlatformProjectSpec) -> bool {
    let allowed: Vec<&str> = project
        .cve_allowlist
        .iter()
        .flat_map(|list| list.items.iter().map(|i| i.cve_id.as_str()))
        .collect();
    project.is_public() != spec.public || allowed != spec.cve_allow_list.iter().map(String::as_str).collect::<Vec<_>>()
}

fn project_request(spec: &PlatformProjectSpec) -> ProjectReq {
    let mut request = ProjectReq::new(&spec.project_name, spec.public).with_cve_allowlist(&spec.cve_allow_list);
    request.storage_limit = spec.storage_limit;
    request
}

async fn write_status(
    ctx: &Context,
    project: &PlatformProject,
    status: PlatformProjectStatus,
    condition: Condition,
) -> Result<()> {
    let previous = project.status.clone().unwrap_or_default();
    let status = PlatformProjectStatus {
        conditions: merge_conditions(&previous.conditions, project.meta().generation, vec![condition.clone()]),
        observed_generation: project.meta().generation,
        reason: condition.reason,
        message: condition.message,
        ..status
    };
    patch_status(&namespaced_api(&ctx.client, project), &project.name_any(), project.status.as_ref(), &status).await
}

async fn harbor_for(ctx: &Context, server_configuration: &str) -> Result<HarborClient> {
    let config = Api::<ServerConfiguration>::all(ctx.client.clone())
        .get_opt(server_configuration)
        .await?
        .ok_or_else(|| StdError::NotFound(format!("server configuration {server_configuration}")))?;
    HarborClient::from_server_configuration(&ctx.client, &config).await
}

/// Runs one stage, recording a failure under `{stage}Error` before handing it back.
async fn stage<T>(
    ctx: &Context,
    project: &PlatformProject,
    status: &PlatformProjectStatus,
    name: &str,
    result: Result<T>,
) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(error) => {
            let condition = Condition::new(READY_CONDITION, false, &error.reason(name), error.to_string());
            let failed = PlatformProjectStatus {
                status: StatusPhase::Fail,
                ..status.clone()
            };
            write_status(ctx, project, failed, condition).await?;
            Err(error)
        }
    }
}

async fn ensure_project(harbor: &HarborClient, spec: &PlatformProjectSpec) -> Result<i64> {
    match harbor.get_project(&spec.project_name).await? {
        Some(project) => {
            if project_drifted(&project, spec) {
                info!("Updating project '{}'", spec.project_name);
                harbor.update_project(project.project_id, &project_request(spec)).await?;
            }
            Ok(project.project_id)
        }
        None => harbor.create_project(&project_request(spec)).await,
    }
}

/// Brings the quota in line, caching its ID in `status`.
async fn ensure_quota(harbor: &HarborClient, spec: &PlatformProjectSpec, status: &mut PlatformProjectStatus, project_id: i64) -> Result<()> {
    let Some(limit) = spec.storage_limit else {
        return Ok(());
    };
    let quota = harbor
        .get_quota_by_project_id(project_id)
        .await?
        .ok_or_else(|| StdError::NotFound(format!("quota of project {project_id}")))?;
    status.quota_id = Some(quota.id);
    if quota.storage_limit() != Some(limit) {
        info!("Setting storage limit of '{}' to {}", spec.project_name, limit);
        harbor.update_project_quota(quota.id, limit).await?;
    }
    Ok(())
}

/// Applies the membership diff; returns the fingerprint of the result.
async fn ensure_members(harbor: &HarborClient, spec: &PlatformProjectSpec, known: Option<&str>, project_id: i64) -> Result<String> {
    let current = harbor.list_project_members(project_id).await?;
    let hash = members_hash(&current, &spec.members)?;
    if known == Some(hash.as_str()) {
        return Ok(hash);
    }

    let plan = plan_members(&current, &spec.members)?;
    if plan.is_empty() {
        return Ok(hash);
    }
    for (member_id, role) in &plan.update {
        harbor.update_project_member(project_id, *member_id, *role).await?;
    }
    for member_id in &plan.delete {
        harbor.delete_project_member(project_id, *member_id).await?;
    }
    for request in &plan.create {
        harbor.create_project_member(project_id, request).await?;
    }
    info!(
        "Reconciled members of '{}': {} updated, {} deleted, {} created",
        spec.project_name,
        plan.update.len(),
        plan.delete.len(),
        plan.create.len()
    );

    let current = harbor.list_project_members(project_id).await?;
    members_hash(&current, &spec.members)
}

async fn apply(project: Arc<PlatformProject>, ctx: Arc<Context>) -> Result<Action> {
    let spec = &project.spec;
    let mut status = project.status.clone().unwrap_or_default();

    let harbor = stage(&ctx, &project, &status, "Connect", harbor_for(&ctx, &spec.server_configuration).await).await?;
    let project_id = stage(&ctx, &project, &status, "ApplyProject", ensure_project(&harbor, spec).await).await?;
    status.project_id = Some(project_id);

    let quota = ensure_quota(&harbor, spec, &mut status, project_id).await;
    stage(&ctx, &project, &status, "UpdateProjectQuota", quota).await?;

    let members = ensure_members(&harbor, spec, status.members_hash.as_deref(), project_id).await;
    let hash = stage(&ctx, &project, &status, "ApplyMembers", members).await?;
    let changed = status.members_hash.as_deref() != Some(hash.as_str());
    status.members_hash = Some(hash);

    status.status = StatusPhase::Ready;
    write_status(
        &ctx,
        &project,
        status,
        Condition::new(READY_CONDITION, true, "Applied", format!("project {project_id} in sync")),
    )
    .await?;
    if changed {
        ctx.publish_event(
            project.as_ref(),
            EventType::Normal,
            "ProjectApplied",
            "Applying",
            format!("project {} ({project_id}) in sync", spec.project_name),
        )
        .await;
    }
    Ok(Action::requeue(ctx.config.requeue_period))
}

async fn cleanup(project: Arc<PlatformProject>, ctx: Arc<Context>) -> Result<Action> {
    let spec = &project.spec;
    let harbor = match harbor_for(&ctx, &spec.server_configuration).await {
        Ok(harbor) => harbor,
        Err(e) => {
            warn!("Leaving remote project {} in place: {}", spec.project_name, e);
            return Ok(Action::await_change());
        }
    };
    let project_id = match project.status.as_ref().and_then(|s| s.project_id) {
        Some(id) => Some(id),
        None => harbor.get_project(&spec.project_name).await?.map(|p| p.project_id),
    };
    if let Some(id) = project_id {
        if harbor.delete_project(id).await? {
            info!("Deleted project '{}' ({})", spec.project_name, id);
        }
    }
    Ok(Action::await_change())
}

pub async fn reconcile(project: Arc<PlatformProject>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !matches_class(project.as_ref(), &ctx.config.class_name) {
        return Ok(Action::await_change());
    }
    let api: Api<PlatformProject> = namespaced_api(&ctx.client, project.as_ref());
    info!("Reconciling {}", object_key(project.as_ref()));
    finalizer(&api, PLATFORM_PROJECT_FINALIZER, project, |event| async {
        match event {
            Finalizer::Apply(project) => apply(project, ctx.clone()).await,
            Finalizer::Cleanup(project) => cleanup(project, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::StdError(StdError::FinalizerError(Box::new(e))))
}

fn error_policy(project: Arc<PlatformProject>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER, project.as_ref(), error);
    if !error.is_transient() {
        return Action::requeue(ctx.config.requeue_period);
    }
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&object_key(project.as_ref())));
    Action::requeue(delay)
}

/// Initialize the platform project controller (given the crds are installed)
pub async fn run(client: Client, ctx: Arc<Context>) {
    ensure_crd::<PlatformProject>(&client).await;

    let (reader, stream) = class_filtered(Api::<PlatformProject>::all(client.clone()), ctx.config.class_name.clone());
    Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("platform project controller: {}", e);
            }
            ready(())
        })
        .await;
}
