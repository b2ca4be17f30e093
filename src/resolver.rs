use std::sync::Arc;

use atrium_api::app::bsky::embed::record_with_media::MainMediaRefs;
use atrium_api::app::bsky::embed::{external, images};
use atrium_api::app::bsky::feed::post::{
    Record as PostRecord, RecordEmbedRefs, RecordLabelsRefs,
};
use atrium_api::types::Union;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use sqlx::{Pool, Postgres};
use tracing::warn;

use crate::appview::AppViewClient;
use crate::cache::PresenceCache;
use crate::db::{self, UserInsert};
use crate::error::IndexerError;
use crate::models::{ExternalEmbed, NewPost, NewUser, PostRow, UserRow};
use crate::text::{sanitize, sanitize_all};

/// Idempotent materialization of users and posts. Firehose records arrive
/// in arbitrary order, so anything a record references (author, reply
/// parent/root, quoted post) may not exist yet and is fetched on demand.
pub struct Resolver {
    db: Pool<Postgres>,
    appview: Arc<AppViewClient>,
    users: PresenceCache,
    posts: PresenceCache,
}

impl Resolver {
    pub fn new(
        db: Pool<Postgres>,
        appview: Arc<AppViewClient>,
        users: PresenceCache,
        posts: PresenceCache,
    ) -> Self {
        Self {
            db,
            appview,
            users,
            posts,
        }
    }

    /// Ensure a user row exists for `did`, fetching the profile when the
    /// database doesn't have one. `Ok(None)` means the actor is gone
    /// upstream and callers should treat the reference as nonexistent.
    pub async fn resolve_user(&self, did: &str) -> Result<Option<String>, IndexerError> {
        if self.users.contains(did) {
            return Ok(Some(did.to_string()));
        }

        if db::get_user_by_did(&self.db, did).await?.is_some() {
            self.users.insert(did).await;
            return Ok(Some(did.to_string()));
        }

        let profile = match self.appview.get_profile(did).await? {
            Some(profile) => profile,
            None => return Ok(None),
        };

        let handle = sanitize(&profile.handle);
        let new_user = NewUser {
            did: did.to_string(),
            display_name: sanitize(profile.display_name.as_deref().unwrap_or(&profile.handle)),
            bio: sanitize(profile.description.as_deref().unwrap_or_default()),
            handle,
        };

        match db::insert_user_unless_handle_conflict(&self.db, &new_user).await {
            Ok(UserInsert::Inserted(_)) => {}
            // A concurrent resolver for the same DID already inserted it.
            Ok(UserInsert::HandleConflict(existing)) if existing.did == did => {}
            Ok(UserInsert::HandleConflict(previous_owner)) => {
                self.reclaim_handle(&new_user, previous_owner).await?;
            }
            Err(e) if e.is_unique_violation("users_pkey") => {
                // Insert raced on did rather than handle; the row exists.
                if db::get_user_by_did(&self.db, did).await?.is_none() {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        self.users.insert(did).await;
        Ok(Some(did.to_string()))
    }

    /// The handle the incoming user claims is held by another DID. Handle
    /// and DID are only eventually consistent upstream, so re-fetch the
    /// previous owner: either they are gone, or they have moved to a new
    /// handle and their row is stale.
    async fn reclaim_handle(
        &self,
        new_user: &NewUser,
        previous_owner: UserRow,
    ) -> Result<(), IndexerError> {
        match self.appview.get_profile(&previous_owner.did).await? {
            None => db::delete_user(&self.db, &previous_owner.did).await?,
            Some(current) => {
                db::update_user_handle(&self.db, &previous_owner.did, &sanitize(&current.handle))
                    .await?
            }
        }

        match db::insert_user_unless_handle_conflict(&self.db, new_user).await {
            Ok(UserInsert::Inserted(_)) => Ok(()),
            Ok(UserInsert::HandleConflict(still_holding)) => {
                // Upstream still reports the handle on the old owner; the
                // next resolution retries once the move propagates.
                warn!(
                    handle = %new_user.handle,
                    previous = %still_holding.did,
                    incoming = %new_user.did,
                    "Handle still held after reconciliation"
                );
                Ok(())
            }
            Err(e) if e.is_unique_violation("users_pkey") => {
                db::update_user_handle(&self.db, &new_user.did, &new_user.handle).await
            }
            Err(e) => Err(e),
        }
    }

    /// Ensure a post row exists for `uri`, fetching (and recursively
    /// materializing) it when missing. `Ok(None)` means the post is gone
    /// upstream. A pre-existing row short-circuits reference-chain
    /// recursion.
    pub fn resolve_post<'a>(
        &'a self,
        uri: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, IndexerError>> {
        async move {
            if self.posts.contains(uri) {
                return Ok(Some(uri.to_string()));
            }

            if db::post_exists(&self.db, uri).await? {
                self.posts.insert(uri).await;
                return Ok(Some(uri.to_string()));
            }

            let view = match self.appview.get_post(uri).await? {
                Some(view) => view,
                None => return Ok(None),
            };

            let record: PostRecord = serde_json::from_value(view.record).map_err(|e| {
                IndexerError::InvalidRecord(format!("fetched post {}: {}", uri, e))
            })?;
            if view.author.did.is_empty() {
                return Err(IndexerError::InvalidRecord(format!(
                    "fetched post {} carries no author did",
                    uri
                )));
            }

            match self
                .insert_post_record(&record, &view.author.did, &view.uri, &view.cid)
                .await?
            {
                Some(row) => Ok(Some(row.uri)),
                None => Ok(None),
            }
        }
        .boxed()
    }

    /// Materialize a post record: resolve the author and every referenced
    /// post, then insert. References that are gone upstream are left unset;
    /// a gone author drops the whole post (`Ok(None)`).
    pub async fn insert_post_record(
        &self,
        record: &PostRecord,
        author_did: &str,
        uri: &str,
        cid: &str,
    ) -> Result<Option<PostRow>, IndexerError> {
        if self.resolve_user(author_did).await?.is_none() {
            return Ok(None);
        }

        let labels = collect_self_labels(record);
        let embed = extract_embed(record);

        let (parent_uri, root_uri) = match &record.reply {
            Some(reply) => {
                let parent = self.resolve_post(&reply.parent.uri).await?;
                let root = if reply.root.uri == reply.parent.uri {
                    parent.clone()
                } else {
                    self.resolve_post(&reply.root.uri).await?
                };
                (parent, root)
            }
            None => (None, None),
        };

        let quoted_uri = match &embed.quoted_uri {
            Some(quoted) => self.resolve_post(quoted).await?,
            None => None,
        };

        let new_post = NewPost {
            uri: uri.to_string(),
            cid: cid.to_string(),
            created_at: parse_datetime(record.created_at.as_str()),
            author_did: author_did.to_string(),
            text: sanitize(&record.text),
            embed: embed.external,
            alt_text: embed.alt_text,
            parent_uri,
            root_uri,
            quoted_uri,
            langs: record
                .langs
                .as_ref()
                .map(|langs| sanitize_all(langs.iter().map(|l| l.as_ref().to_string())))
                .unwrap_or_default(),
            tags: record
                .tags
                .as_ref()
                .map(|tags| sanitize_all(tags.iter()))
                .unwrap_or_default(),
            labels,
        };

        let row = db::insert_post_unless_uri_conflict(&self.db, &new_post).await?;
        self.posts.insert(uri).await;
        Ok(Some(row))
    }

    pub async fn forget_user(&self, did: &str) {
        self.users.invalidate(did).await;
    }

    pub async fn forget_post(&self, uri: &str) {
        self.posts.invalidate(uri).await;
    }
}

#[derive(Debug, Default)]
struct EmbedFields {
    external: Option<ExternalEmbed>,
    alt_text: Option<String>,
    quoted_uri: Option<String>,
}

/// Disambiguate the embed union. Images contribute alt text, external
/// links become the structured embed, record embeds mark the post as a
/// quote; record-with-media contributes both its record and its media.
fn extract_embed(record: &PostRecord) -> EmbedFields {
    let mut fields = EmbedFields::default();

    let embed = match &record.embed {
        Some(Union::Refs(embed)) => embed,
        _ => return fields,
    };

    match embed {
        RecordEmbedRefs::AppBskyEmbedImagesMain(m) => {
            fields.alt_text = images_alt_text(&m.images);
        }
        RecordEmbedRefs::AppBskyEmbedExternalMain(m) => {
            fields.external = external_embed(&m.external);
        }
        RecordEmbedRefs::AppBskyEmbedRecordMain(m) => {
            fields.quoted_uri = Some(m.record.uri.clone());
        }
        RecordEmbedRefs::AppBskyEmbedRecordWithMediaMain(m) => {
            fields.quoted_uri = Some(m.record.record.uri.clone());
            match &m.media {
                Union::Refs(MainMediaRefs::AppBskyEmbedImagesMain(m)) => {
                    fields.alt_text = images_alt_text(&m.images);
                }
                Union::Refs(MainMediaRefs::AppBskyEmbedExternalMain(m)) => {
                    fields.external = external_embed(&m.external);
                }
                _ => {}
            }
        }
        RecordEmbedRefs::AppBskyEmbedVideoMain(_) => {}
    }

    fields
}

fn images_alt_text(images: &[images::Image]) -> Option<String> {
    join_alt_texts(images.iter().map(|image| image.alt.as_str()))
}

fn join_alt_texts<'a>(alts: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined = alts
        .filter(|alt| !alt.is_empty())
        .map(sanitize)
        .collect::<Vec<_>>()
        .join("\n");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn external_embed(external: &external::External) -> Option<ExternalEmbed> {
    let embed = ExternalEmbed {
        title: sanitize(&external.title),
        description: sanitize(&external.description),
        uri: sanitize(&external.uri),
    };
    if embed.is_empty() {
        None
    } else {
        Some(embed)
    }
}

fn collect_self_labels(record: &PostRecord) -> Vec<String> {
    match &record.labels {
        Some(Union::Refs(RecordLabelsRefs::ComAtprotoLabelDefsSelfLabels(labels))) => labels
            .values
            .iter()
            .map(|label| sanitize(&label.val))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_api::app::bsky::feed::post;
    use atrium_api::com::atproto::label::defs::{SelfLabelData, SelfLabelsData};
    use atrium_api::types::string::Datetime;

    fn bare_record(embed: Option<Union<RecordEmbedRefs>>) -> PostRecord {
        post::RecordData {
            created_at: Datetime::now(),
            embed,
            entities: None,
            facets: None,
            labels: None,
            langs: None,
            reply: None,
            tags: None,
            text: "hello".to_string(),
        }
        .into()
    }

    fn external_main(title: &str, description: &str, uri: &str) -> Union<RecordEmbedRefs> {
        Union::Refs(RecordEmbedRefs::AppBskyEmbedExternalMain(Box::new(
            external::MainData {
                external: external::ExternalData {
                    description: description.to_string(),
                    thumb: None,
                    title: title.to_string(),
                    uri: uri.to_string(),
                }
                .into(),
            }
            .into(),
        )))
    }

    #[test]
    fn external_embed_is_extracted_and_sanitized() {
        let record = bare_record(Some(external_main(
            "A\u{202E}title",
            "a description",
            "https://example.com",
        )));
        let fields = extract_embed(&record);
        let embed = fields.external.unwrap();
        assert_eq!(embed.title, "Atitle");
        assert_eq!(embed.uri, "https://example.com");
        assert!(fields.quoted_uri.is_none());
    }

    #[test]
    fn empty_external_embed_collapses_to_absent() {
        let record = bare_record(Some(external_main("", "", "")));
        assert!(extract_embed(&record).external.is_none());
    }

    #[test]
    fn no_embed_yields_no_fields() {
        let record = bare_record(None);
        let fields = extract_embed(&record);
        assert!(fields.external.is_none());
        assert!(fields.alt_text.is_none());
        assert!(fields.quoted_uri.is_none());
    }

    #[test]
    fn alt_texts_join_nonempty_lines() {
        assert_eq!(
            join_alt_texts(["a cat", "", "a dog"].into_iter()),
            Some("a cat\na dog".to_string())
        );
        assert_eq!(join_alt_texts(["", ""].into_iter()), None);
        assert_eq!(join_alt_texts(std::iter::empty::<&str>()), None);
    }

    #[test]
    fn self_labels_are_collected() {
        let mut record = bare_record(None);
        record.labels = Some(Union::Refs(
            RecordLabelsRefs::ComAtprotoLabelDefsSelfLabels(Box::new(
                SelfLabelsData {
                    values: vec![
                        SelfLabelData {
                            val: "porn".to_string(),
                        }
                        .into(),
                        SelfLabelData {
                            val: "graphic-media".to_string(),
                        }
                        .into(),
                    ],
                }
                .into(),
            )),
        ));
        assert_eq!(collect_self_labels(&record), vec!["porn", "graphic-media"]);
        assert!(collect_self_labels(&bare_record(None)).is_empty());
    }

    #[test]
    fn datetime_parses_or_falls_back() {
        let parsed = parse_datetime("2024-06-01T12:00:00Z");
        assert_eq!(parsed.timestamp(), 1_717_243_200);
        // Garbage falls back to "now" rather than failing the record.
        let fallback = parse_datetime("not a date");
        assert!(fallback.timestamp() > 0);
    }
}
