use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::include_res;

/// Milliseconds since the Unix epoch, UTC. Every timestamp column uses this.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub async fn connect(url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
}

pub async fn migrate(db_pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(include_res!(str, "/schema.sql"))
        .execute(db_pool)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum MediaCategory {
    #[serde(rename = "Brand Assets")]
    #[sqlx(rename = "Brand Assets")]
    BrandAssets,
    Mockups,
    #[serde(rename = "Final Designs")]
    #[sqlx(rename = "Final Designs")]
    FinalDesigns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub access_code: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Profile {
    pub id: Uuid,
    #[serde(skip)]
    pub auth_id: Option<String>,
    pub full_name: String,
    pub email: Option<String>,
    pub role: Role,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Membership {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub seq: i64,
    pub organization_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MediaItem {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub uploader_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
    pub category: MediaCategory,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ReadReceipt {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub last_read_at: i64,
}

pub struct NewProfile<'a> {
    pub auth_id: Option<&'a str>,
    pub full_name: &'a str,
    pub email: Option<&'a str>,
    pub role: Role,
}

pub async fn insert_profile(db_pool: &SqlitePool, new: NewProfile<'_>) -> sqlx::Result<Profile> {
    let profile = Profile {
        id: Uuid::now_v7(),
        auth_id: new.auth_id.map(str::to_owned),
        full_name: new.full_name.to_owned(),
        email: new.email.map(str::to_lowercase),
        role: new.role,
        created_at: now_millis(),
    };
    sqlx::query("INSERT INTO profiles (id,auth_id,full_name,email,role,created_at) VALUES (?,?,?,?,?,?)")
        .bind(profile.id)
        .bind(&profile.auth_id)
        .bind(&profile.full_name)
        .bind(&profile.email)
        .bind(profile.role)
        .bind(profile.created_at)
        .execute(db_pool)
        .await?;
    Ok(profile)
}

pub async fn profile(db_pool: &SqlitePool, id: Uuid) -> sqlx::Result<Option<Profile>> {
    sqlx::query_as("SELECT * FROM profiles WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await
}

pub async fn profile_by_email(db_pool: &SqlitePool, email: &str) -> sqlx::Result<Option<Profile>> {
    sqlx::query_as("SELECT * FROM profiles WHERE email=?")
        .bind(email.to_lowercase())
        .fetch_optional(db_pool)
        .await
}

/// Role of an author, if their profile still resolves.
pub async fn role_of(db_pool: &SqlitePool, user_id: Uuid) -> sqlx::Result<Option<Role>> {
    Ok(sqlx::query_as::<_, (Role,)>("SELECT role FROM profiles WHERE id=?")
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .map(|(role,)| role))
}

pub async fn organization(db_pool: &SqlitePool, id: Uuid) -> sqlx::Result<Option<Organization>> {
    sqlx::query_as("SELECT * FROM organizations WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await
}

pub async fn is_member(db_pool: &SqlitePool, organization_id: Uuid, user_id: Uuid) -> sqlx::Result<bool> {
    Ok(sqlx::query("SELECT 1 FROM organization_members WHERE organization_id=? AND user_id=?")
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}

pub async fn message(db_pool: &SqlitePool, id: Uuid) -> sqlx::Result<Option<Message>> {
    sqlx::query_as("SELECT * FROM messages WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await
}

pub async fn media_item(db_pool: &SqlitePool, id: Uuid) -> sqlx::Result<Option<MediaItem>> {
    sqlx::query_as("SELECT * FROM media_items WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) async fn pool() -> SqlitePool {
        let db_pool = connect("sqlite::memory:", 1).await.unwrap();
        migrate(&db_pool).await.unwrap();
        db_pool
    }

    pub(crate) async fn profile(db_pool: &SqlitePool, name: &str, role: Role) -> Profile {
        insert_profile(db_pool, NewProfile {
            auth_id: None,
            full_name: name,
            email: Some(&format!("{}@portal.test", name.to_lowercase())),
            role,
        })
        .await
        .unwrap()
    }

    pub(crate) async fn organization(db_pool: &SqlitePool, name: &str) -> Organization {
        crate::orgs::create_organization(db_pool, name, None).await.unwrap()
    }

    pub(crate) async fn message_at(
        db_pool: &SqlitePool,
        organization_id: Uuid,
        sender_id: Uuid,
        content: &str,
        created_at: i64,
    ) -> Message {
        crate::views::messages::insert_message(db_pool, organization_id, sender_id, content, created_at)
            .await
            .unwrap()
    }
}
