//! In-process implementation of [`UserStore`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::user::{LocalGroup, LocalUser, UserStore};

/// Users and groups kept in process memory.
///
/// Every mutation holds the write lock, which makes `save` atomic per
/// username.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<i64, LocalUser>,
    usernames: HashMap<String, i64>,
    groups: BTreeMap<String, LocalGroup>,
    links: BTreeSet<(i64, i64)>,
    last_user_id: i64,
    last_group_id: i64,
}

impl Inner {
    fn load(&self, id: i64) -> Option<LocalUser> {
        let mut user = self.users.get(&id)?.clone();
        user.groups = self.groups_of(id);
        Some(user)
    }

    fn groups_of(&self, user_id: i64) -> Vec<LocalGroup> {
        // `groups` is keyed by name, so the result is ordered by name.
        self.groups
            .values()
            .filter(|group| self.links.contains(&(user_id, group.id)))
            .cloned()
            .collect()
    }
}

impl MemoryStore {
    /// Number of stored users.
    pub async fn user_count(&self) -> usize {
        self.inner.read().await.users.len()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<LocalUser>> {
        let inner = self.inner.read().await;
        Ok(inner
            .usernames
            .get(username)
            .and_then(|id| inner.load(*id)))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<LocalUser>> {
        Ok(self.inner.read().await.load(id))
    }

    async fn save(&self, user: &LocalUser) -> Result<LocalUser> {
        let mut inner = self.inner.write().await;

        let existing = inner.usernames.get(&user.username).copied();
        let id = match existing {
            Some(id) => id,
            None => {
                inner.last_user_id += 1;
                let id = inner.last_user_id;
                inner.usernames.insert(user.username.clone(), id);
                id
            },
        };

        let mut record = LocalUser {
            id: Some(id),
            groups: Vec::new(),
            ..user.clone()
        };
        // The password is only written on creation.
        if let Some(existing) = inner.users.get(&id) {
            record.password.clone_from(&existing.password);
            record.date_joined = existing.date_joined;
        }
        let mut saved = record.clone();
        saved.groups = inner.groups_of(id);
        inner.users.insert(id, record);

        Ok(saved)
    }

    async fn find_group(&self, name: &str) -> Result<Option<LocalGroup>> {
        Ok(self.inner.read().await.groups.get(name).cloned())
    }

    async fn create_group(&self, name: &str) -> Result<LocalGroup> {
        let mut inner = self.inner.write().await;
        if let Some(group) = inner.groups.get(name) {
            return Ok(group.clone());
        }

        inner.last_group_id += 1;
        let group = LocalGroup {
            id: inner.last_group_id,
            name: name.to_owned(),
        };
        inner.groups.insert(name.to_owned(), group.clone());
        Ok(group)
    }

    async fn add_group(&self, user_id: i64, group: &LocalGroup) -> Result<()> {
        self.inner.write().await.links.insert((user_id, group.id));
        Ok(())
    }

    async fn remove_group(
        &self,
        user_id: i64,
        group: &LocalGroup,
    ) -> Result<()> {
        self.inner.write().await.links.remove(&(user_id, group.id));
        Ok(())
    }

    async fn groups_of(&self, user_id: i64) -> Result<Vec<LocalGroup>> {
        Ok(self.inner.read().await.groups_of(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_is_an_upsert() {
        let store = MemoryStore::default();

        let created = store.save(&LocalUser::new("alice")).await.unwrap();
        assert_eq!(created.id, Some(1));

        let mut update = LocalUser::new("alice");
        update.first_name = "Alice".into();
        let updated = store.save(&update).await.unwrap();

        assert_eq!(updated.id, Some(1));
        assert_eq!(updated.first_name, "Alice");
        assert_eq!(updated.password, created.password);
        assert_eq!(updated.date_joined, created.date_joined);
        assert_eq!(store.user_count().await, 1);

        let bob = store.save(&LocalUser::new("bob")).await.unwrap();
        assert_eq!(bob.id, Some(2));
        assert_eq!(store.user_count().await, 2);
    }

    #[tokio::test]
    async fn test_lookup() {
        let store = MemoryStore::default();
        let saved = store.save(&LocalUser::new("alice")).await.unwrap();

        let by_name = store.find_by_username("alice").await.unwrap();
        let by_id = store.find_by_id(saved.id.unwrap()).await.unwrap();
        assert_eq!(by_name, Some(saved.clone()));
        assert_eq!(by_id, Some(saved));

        assert_eq!(store.find_by_username("bob").await.unwrap(), None);
        assert_eq!(store.find_by_id(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_group_links() {
        let store = MemoryStore::default();
        let id = store
            .save(&LocalUser::new("alice"))
            .await
            .unwrap()
            .id
            .unwrap();
        let ponies = store.create_group("MyPonies").await.unwrap();
        let admins = store.create_group("MyAdmins").await.unwrap();
        assert_eq!(store.create_group("MyAdmins").await.unwrap(), admins);

        store.add_group(id, &ponies).await.unwrap();
        store.add_group(id, &admins).await.unwrap();
        store.add_group(id, &admins).await.unwrap();
        assert_eq!(store.groups_of(id).await.unwrap(), vec![
            admins.clone(),
            ponies.clone()
        ]);

        store.remove_group(id, &admins).await.unwrap();
        store.remove_group(id, &admins).await.unwrap();
        let user = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(user.groups, vec![ponies]);
        assert!(user.in_group("MyPonies"));

        assert_eq!(store.find_group("missing").await.unwrap(), None);
    }
}
