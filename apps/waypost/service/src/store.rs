use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::identity::{
    EmailRedemption, EmailTicketRecord, IdentityError, IdentitySource, SocialNetwork, UserRecord,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub scope: BTreeMap<String, bool>,
    #[serde(default)]
    pub secret: String,
    /// Pre-configured redirection endpoint. Clients with a callback are locked
    /// to it and never accept a caller-supplied redirect URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl ClientRecord {
    pub fn has_scope(&self, capability: &str) -> bool {
        self.scope.get(capability).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub id: String,
    pub user: String,
    pub client: String,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRecord {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Account id once the participant is a registered user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Placeholder id for a participant that was invited but has not joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inviter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{message}")]
    Persistence { message: String },
    #[error("{message}")]
    Conflict { message: String },
}

/// Key-addressed record access used by the ticket and invitation flows.
///
/// Lookups return `Ok(None)` for absent records; `Err` is reserved for real
/// backing-store failures.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn client_by_name(&self, name: &str) -> Result<Option<ClientRecord>, StoreError>;

    async fn grants_for(&self, user: &str, client: &str) -> Result<Vec<GrantRecord>, StoreError>;

    async fn insert_grant(&self, grant: GrantRecord) -> Result<(), StoreError>;

    /// Deletes grants by id. Unknown ids are ignored.
    async fn remove_grants(&self, ids: &[String]) -> Result<(), StoreError>;

    async fn invite_by_code(&self, code: &str) -> Result<Option<InviteRecord>, StoreError>;

    async fn increment_invite_count(&self, code: &str) -> Result<(), StoreError>;

    async fn project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError>;

    /// Swaps the placeholder participant `pid` for the account `user`.
    async fn replace_participant(
        &self,
        project_id: &str,
        pid: &str,
        user: &str,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    clients: HashMap<String, ClientRecord>,
    grants: HashMap<String, GrantRecord>,
    invites: HashMap<String, InviteRecord>,
    projects: HashMap<String, ProjectRecord>,
    users: HashMap<String, UserRecord>,
    email_tickets: HashMap<String, EmailTicketRecord>,
}

/// In-process record store with an optional JSON snapshot on disk.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.store_path.clone();
        let state = Self::load_state(path.as_ref());
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    fn load_state(path: Option<&PathBuf>) -> StoreState {
        let Some(path) = path else {
            return StoreState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return StoreState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "waypost.store",
                    path = %path.display(),
                    error = %error,
                    "failed to read record store; booting with empty state",
                );
                return StoreState::default();
            }
        };

        match serde_json::from_str::<StoreState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: "waypost.store",
                    path = %path.display(),
                    error = %error,
                    "failed to parse record store; booting with empty state",
                );
                StoreState::default()
            }
        }
    }

    async fn persist_state(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| StoreError::Persistence {
                    message: format!("failed to prepare record store directory: {error}"),
                })?;
        }

        let payload = serde_json::to_vec(state).map_err(|error| StoreError::Persistence {
            message: format!("failed to encode record store payload: {error}"),
        })?;
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| StoreError::Persistence {
                message: format!("failed to write record store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| StoreError::Persistence {
                message: format!("failed to finalize record store payload: {error}"),
            })?;

        Ok(())
    }

    async fn mutate<R>(&self, apply: impl FnOnce(&mut StoreState) -> R) -> Result<R, StoreError> {
        let (result, snapshot) = {
            let mut state = self.state.write().await;
            let result = apply(&mut state);
            let snapshot = self.path.is_some().then(|| state.clone());
            (result, snapshot)
        };

        if let Some(snapshot) = snapshot {
            self.persist_state(&snapshot).await?;
        }

        Ok(result)
    }

    pub async fn insert_client(&self, client: ClientRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.clients.insert(client.name.clone(), client);
        })
        .await
    }

    pub async fn insert_invite(&self, invite: InviteRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.invites.insert(invite.code.clone(), invite);
        })
        .await
    }

    pub async fn insert_project(&self, project: ProjectRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.projects.insert(project.id.clone(), project);
        })
        .await
    }

    pub async fn insert_user(&self, user: UserRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.users.insert(user.id.clone(), user);
        })
        .await
    }

    pub async fn insert_email_ticket(&self, ticket: EmailTicketRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.email_tickets.insert(ticket.token.clone(), ticket);
        })
        .await
    }

    pub async fn grant_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state.grants.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn client_by_name(&self, name: &str) -> Result<Option<ClientRecord>, StoreError> {
        Ok(self.state.read().await.clients.get(name).cloned())
    }

    async fn grants_for(&self, user: &str, client: &str) -> Result<Vec<GrantRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .grants
            .values()
            .filter(|grant| grant.user == user && grant.client == client)
            .cloned()
            .collect())
    }

    async fn insert_grant(&self, grant: GrantRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.grants.insert(grant.id.clone(), grant);
        })
        .await
    }

    async fn remove_grants(&self, ids: &[String]) -> Result<(), StoreError> {
        self.mutate(|state| {
            for id in ids {
                state.grants.remove(id);
            }
        })
        .await
    }

    async fn invite_by_code(&self, code: &str) -> Result<Option<InviteRecord>, StoreError> {
        Ok(self.state.read().await.invites.get(code).cloned())
    }

    async fn increment_invite_count(&self, code: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            if let Some(invite) = state.invites.get_mut(code) {
                invite.count = Some(invite.count.unwrap_or(0).saturating_add(1));
            }
        })
        .await
    }

    async fn project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        Ok(self.state.read().await.projects.get(id).cloned())
    }

    async fn replace_participant(
        &self,
        project_id: &str,
        pid: &str,
        user: &str,
    ) -> Result<(), StoreError> {
        let replaced = self
            .mutate(|state| {
                let Some(project) = state.projects.get_mut(project_id) else {
                    return Err(StoreError::Conflict {
                        message: format!("project {project_id} no longer exists"),
                    });
                };

                if project
                    .participants
                    .iter()
                    .any(|participant| participant.id.as_deref() == Some(user))
                {
                    return Err(StoreError::Conflict {
                        message: "User is already a project participant".to_string(),
                    });
                }

                let Some(participant) = project
                    .participants
                    .iter_mut()
                    .find(|participant| participant.pid.as_deref() == Some(pid))
                else {
                    return Err(StoreError::Conflict {
                        message: "Invitation was already claimed".to_string(),
                    });
                };

                participant.id = Some(user.to_string());
                participant.pid = None;
                participant.code = None;
                participant.inviter = None;
                Ok(())
            })
            .await?;
        replaced
    }
}

#[async_trait]
impl IdentitySource for MemoryStore {
    async fn user_by_id(&self, id: &str) -> Result<Option<UserRecord>, IdentityError> {
        Ok(self.state.read().await.users.get(id).cloned())
    }

    async fn user_by_network(
        &self,
        network: SocialNetwork,
        account: &str,
    ) -> Result<Option<UserRecord>, IdentityError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|user| {
                user.networks
                    .get(network.as_str())
                    .is_some_and(|linked| linked == account)
            })
            .cloned())
    }

    async fn redeem_email_ticket(&self, token: &str) -> Result<EmailRedemption, IdentityError> {
        let now = Utc::now();
        let redeemed = self
            .mutate(|state| {
                let Some(ticket) = state.email_tickets.get_mut(token) else {
                    return Err(IdentityError::Rejected {
                        message: "Invalid email token".to_string(),
                    });
                };
                if ticket.consumed {
                    return Err(IdentityError::Rejected {
                        message: "Email token already used".to_string(),
                    });
                }
                if ticket.expires.is_some_and(|expires| expires <= now) {
                    return Err(IdentityError::Rejected {
                        message: "Email token expired".to_string(),
                    });
                }
                let Some(user) = state.users.get(&ticket.user).cloned() else {
                    return Err(IdentityError::Rejected {
                        message: "Email token references an unknown account".to_string(),
                    });
                };

                ticket.consumed = true;
                Ok(EmailRedemption {
                    ticket: ticket.clone(),
                    user,
                })
            })
            .await
            .map_err(|error| IdentityError::Unavailable {
                message: error.to_string(),
            })?;
        redeemed
    }
}
