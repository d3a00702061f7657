use std::{collections::HashMap, sync::Arc};

use gateway::{RemoteStore, RemoteStoreExt};
use shared::{
    domain::{Role, UserId, UserProfile},
    protocol::{Table, UserRow},
    query::{Filter, Query},
};
use tokio::sync::RwLock;
use tracing::warn;

/// Cache of author profiles, filled lazily from the `users` table.
pub struct AuthorDirectory {
    gateway: Arc<dyn RemoteStore>,
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl AuthorDirectory {
    pub fn new(gateway: Arc<dyn RemoteStore>) -> Self {
        Self {
            gateway,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_known(
        gateway: Arc<dyn RemoteStore>,
        profiles: impl IntoIterator<Item = UserProfile>,
    ) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|profile| (profile.user_id.clone(), profile))
            .collect();
        Self {
            gateway,
            profiles: RwLock::new(profiles),
        }
    }

    pub async fn remember(&self, profile: UserProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    pub async fn cached(&self, user_id: &UserId) -> Option<UserProfile> {
        self.profiles.read().await.get(user_id).cloned()
    }

    /// Profiles for `ids`. Unknown ids are fetched in one query; a failed fetch leaves them out.
    pub async fn resolve(
        &self,
        ids: impl IntoIterator<Item = UserId>,
    ) -> HashMap<UserId, UserProfile> {
        let mut wanted: Vec<UserId> = ids.into_iter().collect();
        wanted.sort();
        wanted.dedup();

        let missing: Vec<UserId> = {
            let profiles = self.profiles.read().await;
            wanted
                .iter()
                .filter(|id| !profiles.contains_key(*id))
                .cloned()
                .collect()
        };

        if !missing.is_empty() {
            let query = Query::new(Table::Users)
                .filter(Filter::is_in("id", missing.iter().map(UserId::as_str)));
            match self.gateway.query_as::<UserRow>(query).await {
                Ok(rows) => {
                    let mut profiles = self.profiles.write().await;
                    for row in rows {
                        let profile = UserProfile::from(row);
                        profiles.insert(profile.user_id.clone(), profile);
                    }
                }
                Err(error) => {
                    warn!(%error, missing = missing.len(), "author lookup failed");
                }
            }
        }

        let profiles = self.profiles.read().await;
        wanted
            .into_iter()
            .filter_map(|id| profiles.get(&id).cloned().map(|profile| (id, profile)))
            .collect()
    }

    pub async fn resolve_one(&self, user_id: &UserId) -> Option<UserProfile> {
        self.resolve([user_id.clone()]).await.remove(user_id)
    }

    pub async fn role_of(&self, user_id: &UserId) -> Role {
        self.resolve_one(user_id)
            .await
            .map(|profile| profile.role)
            .unwrap_or_default()
    }
}

pub fn usernames(profiles: &HashMap<UserId, UserProfile>) -> HashMap<UserId, String> {
    profiles
        .iter()
        .map(|(id, profile)| (id.clone(), profile.username.clone()))
        .collect()
}
