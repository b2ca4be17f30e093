use std::sync::Arc;

use anyhow::{Context, Result};
use atrium_api::app::bsky::actor::profile::Record as ProfileRecord;
use atrium_api::app::bsky::feed::like::Record as LikeRecord;
use atrium_api::app::bsky::feed::post::Record as PostRecord;
use atrium_api::app::bsky::feed::repost::Record as RepostRecord;
use atrium_api::app::bsky::graph::follow::Record as FollowRecord;
use sqlx::{Pool, Postgres};
use tracing::{debug, warn};

use crate::db;
use crate::resolver::Resolver;
use crate::text::{sanitize, sanitize_opt};

/// One handler per record kind, mapping a validated lexicon record to graph
/// mutations. Every handler is idempotent (inserts upsert and deletes
/// tolerate absent rows), so replaying a commit is a no-op.
pub struct RecordHandlers {
    db: Pool<Postgres>,
    resolver: Arc<Resolver>,
}

impl RecordHandlers {
    pub fn new(db: Pool<Postgres>, resolver: Arc<Resolver>) -> Self {
        Self { db, resolver }
    }

    pub async fn post_create(
        &self,
        repo: &str,
        uri: &str,
        cid: &str,
        record: &PostRecord,
    ) -> Result<()> {
        let inserted = self
            .resolver
            .insert_post_record(record, repo, uri, cid)
            .await
            .with_context(|| format!("inserting post {}", uri))?;

        if inserted.is_none() {
            warn!(uri, "Skipping post whose author is gone upstream");
        }
        Ok(())
    }

    pub async fn like_create(&self, repo: &str, rkey: &str, record: &LikeRecord) -> Result<()> {
        let subject = record.subject.uri.as_str();
        // Likes can target feed generators; only post likes are projected.
        if !subject.contains("app.bsky.feed.post") {
            debug!(subject, "Skipping like of a non-post subject");
            return Ok(());
        }

        let Some(post_uri) = self
            .resolver
            .resolve_post(subject)
            .await
            .with_context(|| format!("resolving like subject {}", subject))?
        else {
            warn!(subject, "Skipping like of a post that is gone upstream");
            return Ok(());
        };
        let Some(user_did) = self
            .resolver
            .resolve_user(repo)
            .await
            .with_context(|| format!("resolving like author {}", repo))?
        else {
            warn!(repo, "Skipping like by a user that is gone upstream");
            return Ok(());
        };

        db::add_like(&self.db, &post_uri, &user_did, rkey)
            .await
            .with_context(|| format!("adding like {}/{}", user_did, rkey))?;
        Ok(())
    }

    pub async fn repost_create(&self, repo: &str, rkey: &str, record: &RepostRecord) -> Result<()> {
        let subject = record.subject.uri.as_str();

        let Some(post_uri) = self
            .resolver
            .resolve_post(subject)
            .await
            .with_context(|| format!("resolving repost subject {}", subject))?
        else {
            warn!(subject, "Skipping repost of a post that is gone upstream");
            return Ok(());
        };
        let Some(user_did) = self
            .resolver
            .resolve_user(repo)
            .await
            .with_context(|| format!("resolving repost author {}", repo))?
        else {
            warn!(repo, "Skipping repost by a user that is gone upstream");
            return Ok(());
        };

        db::add_repost(&self.db, &post_uri, &user_did, rkey)
            .await
            .with_context(|| format!("adding repost {}/{}", user_did, rkey))?;
        Ok(())
    }

    pub async fn follow_create(&self, repo: &str, rkey: &str, record: &FollowRecord) -> Result<()> {
        let subject = record.subject.as_str();

        let Some(subject_did) = self
            .resolver
            .resolve_user(subject)
            .await
            .with_context(|| format!("resolving follow subject {}", subject))?
        else {
            warn!(subject, "Skipping follow of a user that is gone upstream");
            return Ok(());
        };
        let Some(follower_did) = self
            .resolver
            .resolve_user(repo)
            .await
            .with_context(|| format!("resolving follow author {}", repo))?
        else {
            warn!(repo, "Skipping follow by a user that is gone upstream");
            return Ok(());
        };

        db::add_follow(&self.db, &subject_did, &follower_did, rkey)
            .await
            .with_context(|| format!("adding follow {}/{}", follower_did, rkey))?;
        Ok(())
    }

    /// The firehose profile record lacks the handle, so creation always
    /// goes through the resolver's profile fetch.
    pub async fn actor_create(&self, repo: &str) -> Result<()> {
        self.resolver
            .resolve_user(repo)
            .await
            .with_context(|| format!("resolving actor {}", repo))?;
        Ok(())
    }

    /// Profile update, and the `#identity` refresh when `record` is absent.
    /// Missing fields keep their stored values.
    pub async fn actor_update(&self, repo: &str, record: Option<&ProfileRecord>) -> Result<()> {
        let Some(did) = self
            .resolver
            .resolve_user(repo)
            .await
            .with_context(|| format!("resolving actor {}", repo))?
        else {
            warn!(repo, "Skipping update for a user that is gone upstream");
            return Ok(());
        };

        if let Some(record) = record {
            db::update_user_profile(
                &self.db,
                &did,
                sanitize_opt(record.display_name.as_deref()).as_deref(),
                sanitize_opt(record.description.as_deref()).as_deref(),
            )
            .await
            .with_context(|| format!("updating profile {}", did))?;
        }
        Ok(())
    }

    pub async fn handle_update(&self, did: &str, handle: &str) -> Result<()> {
        let Some(did) = self
            .resolver
            .resolve_user(did)
            .await
            .with_context(|| format!("resolving actor {}", did))?
        else {
            warn!(did, "Skipping handle update for a user that is gone upstream");
            return Ok(());
        };

        db::update_user_handle(&self.db, &did, &sanitize(handle))
            .await
            .with_context(|| format!("updating handle for {}", did))?;
        Ok(())
    }

    pub async fn post_delete(&self, uri: &str) -> Result<()> {
        db::delete_post(&self.db, uri)
            .await
            .with_context(|| format!("deleting post {}", uri))?;
        self.resolver.forget_post(uri).await;
        Ok(())
    }

    pub async fn like_delete(&self, repo: &str, rkey: &str) -> Result<()> {
        db::remove_like(&self.db, repo, rkey)
            .await
            .with_context(|| format!("removing like {}/{}", repo, rkey))?;
        Ok(())
    }

    pub async fn repost_delete(&self, repo: &str, rkey: &str) -> Result<()> {
        db::remove_repost(&self.db, repo, rkey)
            .await
            .with_context(|| format!("removing repost {}/{}", repo, rkey))?;
        Ok(())
    }

    pub async fn follow_delete(&self, repo: &str, rkey: &str) -> Result<()> {
        db::remove_follow(&self.db, repo, rkey)
            .await
            .with_context(|| format!("removing follow {}/{}", repo, rkey))?;
        Ok(())
    }

    /// Tombstone: the user row goes, and author-owned posts cascade.
    pub async fn actor_delete(&self, did: &str) -> Result<()> {
        db::delete_user(&self.db, did)
            .await
            .with_context(|| format!("deleting user {}", did))?;
        self.resolver.forget_user(did).await;
        Ok(())
    }
}
