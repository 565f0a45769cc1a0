//! PostgreSQL implementation of [`UserStore`].

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Result;
use crate::user::{LocalGroup, LocalUser, UserStore};

const USER_COLUMNS: &str = "id, username, password, first_name, last_name, \
    email, is_active, is_staff, is_superuser, date_joined, last_login";

/// PostgreSQL user repository.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    /// Create a new [`PgUserStore`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_groups(&self, user: Option<LocalUser>) -> Result<Option<LocalUser>> {
        match user {
            Some(mut user) => {
                if let Some(id) = user.id {
                    user.groups = self.groups_of(id).await?;
                }
                Ok(Some(user))
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<LocalUser>> {
        let user = sqlx::query_as::<_, LocalUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        self.with_groups(user).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<LocalUser>> {
        let user = sqlx::query_as::<_, LocalUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        self.with_groups(user).await
    }

    async fn save(&self, user: &LocalUser) -> Result<LocalUser> {
        // The password is only written on creation.
        let mut saved = sqlx::query_as::<_, LocalUser>(&format!(
            r#"INSERT INTO users (
                username, password, first_name, last_name, email,
                is_active, is_staff, is_superuser, date_joined, last_login
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (username) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email = EXCLUDED.email,
                is_active = EXCLUDED.is_active,
                is_staff = EXCLUDED.is_staff,
                is_superuser = EXCLUDED.is_superuser,
                last_login = EXCLUDED.last_login
            RETURNING {USER_COLUMNS}"#
        ))
        .bind(&user.username)
        .bind(&user.password)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .bind(user.is_active)
        .bind(user.is_staff)
        .bind(user.is_superuser)
        .bind(user.date_joined)
        .bind(user.last_login)
        .fetch_one(&self.pool)
        .await?;

        if let Some(id) = saved.id {
            saved.groups = self.groups_of(id).await?;
        }

        Ok(saved)
    }

    async fn find_group(&self, name: &str) -> Result<Option<LocalGroup>> {
        Ok(sqlx::query_as::<_, LocalGroup>(
            "SELECT id, name FROM groups WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_group(&self, name: &str) -> Result<LocalGroup> {
        Ok(sqlx::query_as::<_, LocalGroup>(
            r#"INSERT INTO groups (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name"#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn add_group(&self, user_id: i64, group: &LocalGroup) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO user_groups (user_id, group_id) VALUES ($1, $2)
            ON CONFLICT DO NOTHING"#,
        )
        .bind(user_id)
        .bind(group.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_group(
        &self,
        user_id: i64,
        group: &LocalGroup,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM user_groups WHERE user_id = $1 AND group_id = $2",
        )
        .bind(user_id)
        .bind(group.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn groups_of(&self, user_id: i64) -> Result<Vec<LocalGroup>> {
        Ok(sqlx::query_as::<_, LocalGroup>(
            r#"SELECT g.id, g.name
            FROM groups g
            JOIN user_groups ug ON ug.group_id = g.id
            WHERE ug.user_id = $1
            ORDER BY g.name"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance on DATABASE_URL"]
    async fn test_save_is_an_upsert(pool: Pool<Postgres>) {
        let store = PgUserStore::new(pool);

        let created = store.save(&LocalUser::new("Alice")).await.unwrap();
        assert_eq!(created.username, "alice");
        let id = created.id.unwrap();

        let mut update = LocalUser::new("alice");
        update.email = "alice@example.org".into();
        update.is_staff = true;
        let updated = store.save(&update).await.unwrap();

        assert_eq!(updated.id, Some(id));
        assert_eq!(updated.email, "alice@example.org");
        assert!(updated.is_staff);
        // The first unusable password is kept.
        assert_eq!(updated.password, created.password);
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance on DATABASE_URL"]
    async fn test_group_links(pool: Pool<Postgres>) {
        let store = PgUserStore::new(pool);
        let user = store.save(&LocalUser::new("bob")).await.unwrap();
        let id = user.id.unwrap();
        let admins = store.create_group("MyAdmins").await.unwrap();
        let ponies = store.create_group("MyPonies").await.unwrap();

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

        assert_eq!(store.find_group("missing").await.unwrap(), None);
    }
}
