use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;

use crate::api_envelope::OAuthError;
use crate::store::{GrantRecord, RecordStore};

/// Tracks which clients each user has authorized.
#[derive(Clone)]
pub struct GrantAuthority {
    store: Arc<dyn RecordStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantEvaluation {
    pub authorized: bool,
    /// Ids of grants observed expired, oldest first.
    pub expired: Vec<String>,
}

/// Orders grants by expiration and splits them at `now`. A grant expiring
/// exactly at `now` counts as expired.
pub fn evaluate_grants(mut grants: Vec<GrantRecord>, now: DateTime<Utc>) -> GrantEvaluation {
    grants.sort_by(|left, right| left.expiration.cmp(&right.expiration));

    let (expired, live): (Vec<GrantRecord>, Vec<GrantRecord>) = grants
        .into_iter()
        .partition(|grant| grant.expiration <= now);

    GrantEvaluation {
        authorized: !live.is_empty(),
        expired: expired.into_iter().map(|grant| grant.id).collect(),
    }
}

impl GrantAuthority {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn check_authorization(&self, user: &str, client: &str) -> Result<(), OAuthError> {
        self.check_authorization_at(user, client, Utc::now())
            .await
            .map(|_| ())
    }

    /// Evaluates the pair at `now`. Expired grants found along the way are
    /// handed to a background deletion whose handle is returned.
    pub async fn check_authorization_at(
        &self,
        user: &str,
        client: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JoinHandle<()>>, OAuthError> {
        let grants = match self.store.grants_for(user, client).await {
            Ok(grants) => grants,
            Err(error) => {
                tracing::warn!(
                    target: "waypost.grants",
                    user,
                    client,
                    error = %error,
                    "grant lookup failed",
                );
                return Err(OAuthError::server_error("Failed retrieving authorization"));
            }
        };

        if grants.is_empty() {
            return Err(OAuthError::invalid_grant("Client is not authorized"));
        }

        let evaluation = evaluate_grants(grants, now);
        let cleanup = if evaluation.expired.is_empty() {
            None
        } else {
            Some(self.spawn_cleanup(evaluation.expired))
        };

        if evaluation.authorized {
            Ok(cleanup)
        } else {
            Err(OAuthError::invalid_grant("Client authorization expired"))
        }
    }

    /// Records a fresh consent grant for the pair.
    pub async fn grant(
        &self,
        user: &str,
        client: &str,
        ttl: Duration,
    ) -> Result<GrantRecord, OAuthError> {
        let expiration = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| OAuthError::server_error("Grant lifetime out of range"))?;
        let record = GrantRecord {
            id: format!("grant_{}", uuid::Uuid::new_v4().simple()),
            user: user.to_string(),
            client: client.to_string(),
            expiration,
        };

        self.store
            .insert_grant(record.clone())
            .await
            .map_err(|error| {
                tracing::warn!(
                    target: "waypost.grants",
                    user,
                    client,
                    error = %error,
                    "failed to record grant",
                );
                OAuthError::server_error("Failed recording authorization")
            })?;

        tracing::info!(target: "waypost.grants", user, client, grant_id = %record.id, "grant recorded");
        Ok(record)
    }

    fn spawn_cleanup(&self, ids: Vec<String>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.remove_grants(&ids).await {
                Ok(()) => {
                    tracing::debug!(target: "waypost.grants", removed = ids.len(), "expired grants removed");
                }
                Err(error) => {
                    tracing::warn!(
                        target: "waypost.grants",
                        pending = ids.len(),
                        error = %error,
                        "expired grant cleanup failed; will retry on next check",
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::api_envelope::OAuthErrorCode;
    use crate::store::{ClientRecord, InviteRecord, MemoryStore, ProjectRecord, StoreError};

    fn grant_at(id: &str, expiration: DateTime<Utc>) -> GrantRecord {
        GrantRecord {
            id: id.to_string(),
            user: "u1".to_string(),
            client: "c1".to_string(),
            expiration,
        }
    }

    /// Store whose grant operations can be made to fail.
    #[derive(Default)]
    struct ScriptedStore {
        grants: Vec<GrantRecord>,
        fail_lookup: bool,
        fail_remove: bool,
        removed: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl RecordStore for ScriptedStore {
        async fn client_by_name(&self, _name: &str) -> Result<Option<ClientRecord>, StoreError> {
            Ok(None)
        }

        async fn grants_for(
            &self,
            _user: &str,
            _client: &str,
        ) -> Result<Vec<GrantRecord>, StoreError> {
            if self.fail_lookup {
                return Err(StoreError::Persistence {
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.grants.clone())
        }

        async fn insert_grant(&self, _grant: GrantRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn remove_grants(&self, ids: &[String]) -> Result<(), StoreError> {
            if let Ok(mut removed) = self.removed.lock() {
                removed.push(ids.to_vec());
            }
            if self.fail_remove {
                return Err(StoreError::Persistence {
                    message: "write refused".to_string(),
                });
            }
            Ok(())
        }

        async fn invite_by_code(&self, _code: &str) -> Result<Option<InviteRecord>, StoreError> {
            Ok(None)
        }

        async fn increment_invite_count(&self, _code: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn project(&self, _id: &str) -> Result<Option<ProjectRecord>, StoreError> {
            Ok(None)
        }

        async fn replace_participant(
            &self,
            _project_id: &str,
            _pid: &str,
            _user: &str,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn evaluation_sorts_then_partitions() {
        let now = Utc::now();
        let evaluation = evaluate_grants(
            vec![
                grant_at("live", now + Duration::milliseconds(100)),
                grant_at("older", now - Duration::milliseconds(5)),
                grant_at("oldest", now - Duration::milliseconds(10)),
            ],
            now,
        );
        assert!(evaluation.authorized);
        assert_eq!(evaluation.expired, vec!["oldest", "older"]);
    }

    #[test]
    fn grant_expiring_exactly_now_is_expired() {
        let now = Utc::now();
        let evaluation = evaluate_grants(vec![grant_at("edge", now)], now);
        assert!(!evaluation.authorized);
        assert_eq!(evaluation.expired, vec!["edge"]);
    }

    #[tokio::test]
    async fn live_grant_authorizes_and_expired_ones_are_deleted() {
        let now = Utc::now();
        let store = Arc::new(ScriptedStore {
            grants: vec![
                grant_at("t-10", now - Duration::milliseconds(10)),
                grant_at("t+100", now + Duration::milliseconds(100)),
                grant_at("t-5", now - Duration::milliseconds(5)),
            ],
            ..ScriptedStore::default()
        });
        let authority = GrantAuthority::new(store.clone());

        let cleanup = authority
            .check_authorization_at("u1", "c1", now)
            .await
            .expect("authorized")
            .expect("cleanup scheduled");
        cleanup.await.expect("cleanup task");

        let removed = store.removed.lock().expect("lock").clone();
        assert_eq!(removed, vec![vec!["t-10".to_string(), "t-5".to_string()]]);
    }

    #[tokio::test]
    async fn all_expired_reports_expiration_and_still_cleans_up() {
        let now = Utc::now();
        let store = Arc::new(ScriptedStore {
            grants: vec![
                grant_at("a", now - Duration::seconds(30)),
                grant_at("b", now - Duration::seconds(1)),
            ],
            ..ScriptedStore::default()
        });
        let authority = GrantAuthority::new(store.clone());

        let error = authority
            .check_authorization_at("u1", "c1", now)
            .await
            .expect_err("expired");
        assert_eq!(error.code, OAuthErrorCode::InvalidGrant);
        assert_eq!(error.message, "Client authorization expired");

        for _ in 0..50 {
            if !store.removed.lock().expect("lock").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.removed.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn no_grants_is_not_authorized() {
        let authority = GrantAuthority::new(Arc::new(ScriptedStore::default()));
        let error = authority
            .check_authorization("u1", "c1")
            .await
            .expect_err("no grants");
        assert_eq!(error.code, OAuthErrorCode::InvalidGrant);
        assert_eq!(error.message, "Client is not authorized");
    }

    #[tokio::test]
    async fn lookup_failure_is_server_error_without_cleanup() {
        let store = Arc::new(ScriptedStore {
            grants: vec![grant_at("old", Utc::now() - Duration::hours(1))],
            fail_lookup: true,
            ..ScriptedStore::default()
        });
        let authority = GrantAuthority::new(store.clone());

        let error = authority
            .check_authorization("u1", "c1")
            .await
            .expect_err("store failure");
        assert_eq!(error.code, OAuthErrorCode::ServerError);
        assert_eq!(error.message, "Failed retrieving authorization");
        assert!(store.removed.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_affect_outcome() {
        let now = Utc::now();
        let store = Arc::new(ScriptedStore {
            grants: vec![
                grant_at("old", now - Duration::hours(1)),
                grant_at("live", now + Duration::hours(1)),
            ],
            fail_remove: true,
            ..ScriptedStore::default()
        });
        let authority = GrantAuthority::new(store.clone());

        let cleanup = authority
            .check_authorization_at("u1", "c1", now)
            .await
            .expect("authorized")
            .expect("cleanup scheduled");
        cleanup.await.expect("cleanup task completes despite failure");
        assert_eq!(store.removed.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn consent_grant_authorizes_pair() {
        let store = Arc::new(MemoryStore::default());
        let authority = GrantAuthority::new(store.clone());

        authority
            .grant("u1", "c1", Duration::days(30))
            .await
            .expect("grant");
        authority
            .check_authorization("u1", "c1")
            .await
            .expect("authorized after consent");
        assert!(authority.check_authorization("u1", "c2").await.is_err());
    }

    #[tokio::test]
    async fn grant_lifetime_past_the_clock_is_a_server_error() {
        let store = Arc::new(MemoryStore::default());
        let authority = GrantAuthority::new(store.clone());

        let error = authority
            .grant("u1", "c1", Duration::MAX)
            .await
            .expect_err("lifetime overflows");
        assert_eq!(error.code, OAuthErrorCode::ServerError);
        assert_eq!(error.message, "Grant lifetime out of range");
        assert!(store.grant_ids().await.is_empty());
    }
}
