use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub did: String,
    pub handle: String,
    pub display_name: String,
    pub bio: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PostRow {
    pub uri: String,
    pub cid: String,
    pub created_at: DateTime<Utc>,
    pub author_did: String,
    pub text: String,
}

/// Fields for a user insert; all text already normalized by the caller.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub did: String,
    pub handle: String,
    pub display_name: String,
    pub bio: String,
}

/// Fields for a post insert; all text already normalized by the caller.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub uri: String,
    pub cid: String,
    pub created_at: DateTime<Utc>,
    pub author_did: String,
    pub text: String,
    pub embed: Option<ExternalEmbed>,
    pub alt_text: Option<String>,
    pub parent_uri: Option<String>,
    pub root_uri: Option<String>,
    pub quoted_uri: Option<String>,
    pub langs: Vec<String>,
    pub tags: Vec<String>,
    pub labels: Vec<String>,
}

/// Structured external-link embed stored on a post. An embed whose fields
/// are all empty collapses to absent before it reaches the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEmbed {
    pub title: String,
    pub description: String,
    pub uri: String,
}

impl ExternalEmbed {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.description.is_empty() && self.uri.is_empty()
    }
}

// Appview response structures. Only the fields the projection needs.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetProfilesResponse {
    pub profiles: Vec<ProfileView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPostsResponse {
    pub posts: Vec<PostView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: AuthorView,
    pub record: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorView {
    pub did: String,
    pub handle: String,
}
