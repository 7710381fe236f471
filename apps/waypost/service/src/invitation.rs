use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api_envelope::ApiError;
use crate::identity::IdentitySource;
use crate::notify::ChangeNotifier;
use crate::store::{InviteRecord, ParticipantRecord, ProjectRecord, RecordStore, StoreError};

const PROJECT_PREFIX: &str = "project";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteCode<'a> {
    Project {
        project: &'a str,
        pid: &'a str,
        code: &'a str,
    },
    Registration(&'a str),
}

/// `project:<project>:<pid>:<code>` with four non-empty segments is a project
/// invitation; anything else is looked up as a registration code.
pub fn parse_invite_code(raw: &str) -> InviteCode<'_> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [PROJECT_PREFIX, project, pid, code]
            if !project.is_empty() && !pid.is_empty() && !code.is_empty() =>
        {
            InviteCode::Project {
                project: *project,
                pid: *pid,
                code: *code,
            }
        }
        _ => InviteCode::Registration(raw),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InviteError {
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Rejected { message: String },
    #[error("{message}")]
    Store { message: String },
}

impl InviteError {
    fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

impl From<StoreError> for InviteError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict { message } => Self::Rejected { message },
            StoreError::Persistence { message } => {
                tracing::warn!(target: "waypost.invites", error = %message, "invite store failure");
                Self::Store { message }
            }
        }
    }
}

impl From<InviteError> for ApiError {
    fn from(error: InviteError) -> Self {
        match error {
            InviteError::NotFound { message } => ApiError::not_found(message),
            InviteError::Rejected { message } => ApiError::bad_request(message),
            InviteError::Store { .. } => ApiError::internal("Failed loading invitation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInvitation {
    pub title: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inviter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InvitationCheck {
    Project(ProjectInvitation),
    Registration(InviteRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimReceipt {
    pub status: &'static str,
    pub project: String,
}

/// Checks a registration invite against its expiry and usage limit.
///
/// A limit is reached once `count` equals it; either field missing means
/// unlimited.
pub fn check_registration(invite: &InviteRecord, now: DateTime<Utc>) -> Result<(), InviteError> {
    if invite.expires.is_some_and(|expires| expires <= now) {
        return Err(InviteError::rejected("Invitation Code expired"));
    }

    let limit_reached = match (invite.count, invite.limit) {
        (Some(count), Some(limit)) => count >= limit,
        _ => false,
    };
    if limit_reached {
        return Err(InviteError::rejected("Invitation code reached limit"));
    }

    Ok(())
}

/// Finds the participant slot for `pid`. The first slot with that pid decides
/// the outcome even when a later one carries the matching code.
pub fn find_participant<'a>(
    project: &'a ProjectRecord,
    pid: &str,
    code: &str,
) -> Option<&'a ParticipantRecord> {
    project
        .participants
        .iter()
        .find(|participant| participant.pid.as_deref() == Some(pid))
        .filter(|participant| participant.code.as_deref() == Some(code))
}

#[derive(Clone)]
pub struct InvitationValidator {
    store: Arc<dyn RecordStore>,
    identities: Arc<dyn IdentitySource>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl InvitationValidator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        identities: Arc<dyn IdentitySource>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            store,
            identities,
            notifier,
        }
    }

    pub async fn check(&self, raw: &str) -> Result<InvitationCheck, InviteError> {
        match parse_invite_code(raw) {
            InviteCode::Project { project, pid, code } => {
                let (project, participant) = self.project_invite(project, pid, code).await?;
                let inviter = self.inviter_display(participant.inviter.as_deref()).await;
                Ok(InvitationCheck::Project(ProjectInvitation {
                    title: project.title,
                    project: project.id,
                    inviter,
                }))
            }
            InviteCode::Registration(code) => {
                self.registration(code).await.map(InvitationCheck::Registration)
            }
        }
    }

    /// Joins `user` to the project named by a project invitation.
    pub async fn claim(&self, raw: &str, user: &str) -> Result<ClaimReceipt, InviteError> {
        let InviteCode::Project { project, pid, code } = parse_invite_code(raw) else {
            return Err(InviteError::rejected("Invalid invitation format"));
        };

        let (project, participant) = self.project_invite(project, pid, code).await?;
        let Some(pid) = participant.pid.as_deref() else {
            return Err(InviteError::rejected("Invalid invitation code"));
        };

        self.store.replace_participant(&project.id, pid, user).await?;
        tracing::info!(target: "waypost.invites", project = %project.id, user, "project invitation claimed");
        self.notifier.project_updated(&project.id, user);

        Ok(ClaimReceipt {
            status: "ok",
            project: project.id,
        })
    }

    /// Validates a registration code and records one use of it.
    pub async fn consume_registration(&self, code: &str) -> Result<InviteRecord, InviteError> {
        let invite = self.registration(code).await?;
        self.store.increment_invite_count(&invite.code).await?;
        tracing::info!(target: "waypost.invites", code = %invite.code, "registration invite consumed");
        Ok(invite)
    }

    async fn registration(&self, code: &str) -> Result<InviteRecord, InviteError> {
        let invite = self
            .store
            .invite_by_code(code)
            .await?
            .ok_or_else(|| InviteError::not_found("Invitation code not found"))?;
        check_registration(&invite, Utc::now())?;
        Ok(invite)
    }

    async fn project_invite(
        &self,
        project_id: &str,
        pid: &str,
        code: &str,
    ) -> Result<(ProjectRecord, ParticipantRecord), InviteError> {
        let project = self
            .store
            .project(project_id)
            .await?
            .ok_or_else(|| InviteError::not_found("Project not found"))?;

        let participant = find_participant(&project, pid, code)
            .cloned()
            .ok_or_else(|| InviteError::rejected("Invalid invitation code"))?;
        Ok((project, participant))
    }

    async fn inviter_display(&self, inviter: Option<&str>) -> Option<String> {
        let inviter = inviter?;
        match self.identities.user_by_id(inviter).await {
            Ok(user) => user.and_then(|user| user.display),
            Err(error) => {
                tracing::debug!(target: "waypost.invites", inviter, error = %error, "inviter lookup failed");
                None
            }
        }
    }
}
