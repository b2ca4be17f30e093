use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::info;

use crate::error::IndexerError;
use crate::models::{NewPost, NewUser, PostRow, UserRow};

pub async fn init_db_pool(database_url: &str) -> Result<Pool<Postgres>> {
    info!("Initializing database connection pool");

    // Calculate optimal connection count based on CPU cores
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or_else(|| {
            let cores = num_cpus::get() as u32;
            cores * 2 + 1 // Common formula for connection pools
        });

    info!("Setting database pool to {} max connections", max_connections);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Outcome of an insert-unless-handle-conflict. The conflicting row comes
/// back so the resolver can run handle-move reconciliation.
#[derive(Debug)]
pub enum UserInsert {
    Inserted(UserRow),
    HandleConflict(UserRow),
}

pub async fn get_user_by_did(
    pool: &Pool<Postgres>,
    did: &str,
) -> Result<Option<UserRow>, IndexerError> {
    let user = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT did, handle, display_name, bio
        FROM users
        WHERE did = $1
        "#,
    )
    .bind(did)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

/// Insert a user, returning the existing row when the handle is already
/// held (the EdgeQL `unlessConflict on handle else User` shape). A unique
/// violation on `did` surfaces as an error for the caller to recover from
/// by re-selecting.
pub async fn insert_user_unless_handle_conflict(
    pool: &Pool<Postgres>,
    user: &NewUser,
) -> Result<UserInsert, IndexerError> {
    // ON CONFLICT DO NOTHING returns no row on conflict, so read after
    // write. The conflicting row can vanish between the two statements
    // under concurrent deletes; retry the insert once in that case.
    for _ in 0..2 {
        let inserted = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (did, handle, display_name, bio)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (handle) DO NOTHING
            RETURNING did, handle, display_name, bio
            "#,
        )
        .bind(&user.did)
        .bind(&user.handle)
        .bind(&user.display_name)
        .bind(&user.bio)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(UserInsert::Inserted(row));
        }

        let existing = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT did, handle, display_name, bio
            FROM users
            WHERE handle = $1
            "#,
        )
        .bind(&user.handle)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = existing {
            return Ok(UserInsert::HandleConflict(row));
        }
    }

    Err(IndexerError::InvalidRecord(format!(
        "insert for {} kept conflicting on a vanishing handle {}",
        user.did, user.handle
    )))
}

pub async fn update_user_handle(
    pool: &Pool<Postgres>,
    did: &str,
    handle: &str,
) -> Result<(), IndexerError> {
    sqlx::query("UPDATE users SET handle = $2 WHERE did = $1")
        .bind(did)
        .bind(handle)
        .execute(pool)
        .await?;

    Ok(())
}

/// Profile update with null-coalescing assignment: a missing field keeps
/// the stored value.
pub async fn update_user_profile(
    pool: &Pool<Postgres>,
    did: &str,
    display_name: Option<&str>,
    bio: Option<&str>,
) -> Result<(), IndexerError> {
    sqlx::query(
        r#"
        UPDATE users
        SET display_name = COALESCE($2, display_name),
            bio = COALESCE($3, bio)
        WHERE did = $1
        "#,
    )
    .bind(did)
    .bind(display_name)
    .bind(bio)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a user; their posts and edges go with them via cascade.
pub async fn delete_user(pool: &Pool<Postgres>, did: &str) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM users WHERE did = $1")
        .bind(did)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn post_exists(pool: &Pool<Postgres>, uri: &str) -> Result<bool, IndexerError> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM posts WHERE uri = $1")
        .bind(uri)
        .fetch_optional(pool)
        .await?;

    Ok(row.is_some())
}

/// Insert a post, returning the existing row on a uri conflict
/// (`unlessConflict on uri else Post`).
pub async fn insert_post_unless_uri_conflict(
    pool: &Pool<Postgres>,
    post: &NewPost,
) -> Result<PostRow, IndexerError> {
    let embed = post
        .embed
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| IndexerError::InvalidRecord(format!("embed for {}: {}", post.uri, e)))?;

    let inserted = sqlx::query_as::<_, PostRow>(
        r#"
        INSERT INTO posts (uri, cid, created_at, author_did, text, embed, alt_text,
                           parent_uri, root_uri, quoted_uri, langs, tags, labels)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (uri) DO NOTHING
        RETURNING uri, cid, created_at, author_did, text
        "#,
    )
    .bind(&post.uri)
    .bind(&post.cid)
    .bind(post.created_at)
    .bind(&post.author_did)
    .bind(&post.text)
    .bind(embed)
    .bind(&post.alt_text)
    .bind(&post.parent_uri)
    .bind(&post.root_uri)
    .bind(&post.quoted_uri)
    .bind(&post.langs)
    .bind(&post.tags)
    .bind(&post.labels)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok(row);
    }

    let existing = sqlx::query_as::<_, PostRow>(
        r#"
        SELECT uri, cid, created_at, author_did, text
        FROM posts
        WHERE uri = $1
        "#,
    )
    .bind(&post.uri)
    .fetch_optional(pool)
    .await?;

    existing.ok_or_else(|| {
        IndexerError::InvalidRecord(format!("post {} conflicted then vanished", post.uri))
    })
}

pub async fn delete_post(pool: &Pool<Postgres>, uri: &str) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM posts WHERE uri = $1")
        .bind(uri)
        .execute(pool)
        .await?;

    Ok(())
}

// Edge sets. Adds are set-union (ON CONFLICT DO NOTHING) and removes are
// set-difference located by (source user, rkey), so re-delivery is a no-op.

pub async fn add_like(
    pool: &Pool<Postgres>,
    post_uri: &str,
    user_did: &str,
    rkey: &str,
) -> Result<(), IndexerError> {
    sqlx::query(
        r#"
        INSERT INTO post_likes (user_did, rkey, post_uri)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_did, rkey) DO NOTHING
        "#,
    )
    .bind(user_did)
    .bind(rkey)
    .bind(post_uri)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn remove_like(
    pool: &Pool<Postgres>,
    user_did: &str,
    rkey: &str,
) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM post_likes WHERE user_did = $1 AND rkey = $2")
        .bind(user_did)
        .bind(rkey)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn add_repost(
    pool: &Pool<Postgres>,
    post_uri: &str,
    user_did: &str,
    rkey: &str,
) -> Result<(), IndexerError> {
    sqlx::query(
        r#"
        INSERT INTO post_reposts (user_did, rkey, post_uri)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_did, rkey) DO NOTHING
        "#,
    )
    .bind(user_did)
    .bind(rkey)
    .bind(post_uri)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn remove_repost(
    pool: &Pool<Postgres>,
    user_did: &str,
    rkey: &str,
) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM post_reposts WHERE user_did = $1 AND rkey = $2")
        .bind(user_did)
        .bind(rkey)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn add_follow(
    pool: &Pool<Postgres>,
    subject_did: &str,
    follower_did: &str,
    rkey: &str,
) -> Result<(), IndexerError> {
    sqlx::query(
        r#"
        INSERT INTO follows (follower_did, rkey, subject_did)
        VALUES ($1, $2, $3)
        ON CONFLICT (follower_did, rkey) DO NOTHING
        "#,
    )
    .bind(follower_did)
    .bind(rkey)
    .bind(subject_did)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn remove_follow(
    pool: &Pool<Postgres>,
    follower_did: &str,
    rkey: &str,
) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM follows WHERE follower_did = $1 AND rkey = $2")
        .bind(follower_did)
        .bind(rkey)
        .execute(pool)
        .await?;

    Ok(())
}
