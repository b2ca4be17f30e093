use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use reqwest::Client as HttpClient;
use reqwest::Response;
use tracing::debug;

use crate::batcher::Batcher;
use crate::coalesce::RequestGroup;
use crate::error::IndexerError;
use crate::limiter::RateLimiter;
use crate::models::{GetPostsResponse, GetProfilesResponse, PostView, ProfileView};

// Upstream caps both lookup endpoints at 25 keys per request.
const MAX_BATCH: usize = 25;
const BATCH_WINDOW: Duration = Duration::from_millis(1000);

/// Typed client for the appview lookup endpoints. Calls are deduplicated by
/// key (coalescer), grouped into multi-key requests (batcher), and issued
/// through the global rate limiter.
pub struct AppViewClient {
    profile_flights: RequestGroup<Option<ProfileView>>,
    post_flights: RequestGroup<Option<PostView>>,
    profile_batcher: Batcher<ProfileView>,
    post_batcher: Batcher<PostView>,
}

impl AppViewClient {
    pub fn new(base_url: String, limiter: Arc<RateLimiter>) -> Result<Self, IndexerError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let profile_batcher = {
            let http = http.clone();
            let base_url = base_url.clone();
            let limiter = Arc::clone(&limiter);
            Batcher::new(MAX_BATCH, BATCH_WINDOW, move |dids| {
                let http = http.clone();
                let base_url = base_url.clone();
                let limiter = Arc::clone(&limiter);
                async move { fetch_profiles(&http, &base_url, &limiter, dids).await }.boxed()
            })
        };

        let post_batcher = {
            let http = http.clone();
            let base_url = base_url.clone();
            let limiter = Arc::clone(&limiter);
            Batcher::new(MAX_BATCH, BATCH_WINDOW, move |uris| {
                let http = http.clone();
                let base_url = base_url.clone();
                let limiter = Arc::clone(&limiter);
                async move { fetch_posts(&http, &base_url, &limiter, uris).await }.boxed()
            })
        };

        Ok(Self {
            profile_flights: RequestGroup::new(),
            post_flights: RequestGroup::new(),
            profile_batcher,
            post_batcher,
        })
    }

    /// Look up a profile by DID. `Ok(None)` means the actor no longer
    /// exists upstream (deleted or deactivated).
    pub async fn get_profile(&self, did: &str) -> Result<Option<ProfileView>, IndexerError> {
        let batcher = self.profile_batcher.clone();
        let key = did.to_string();
        let result = self
            .profile_flights
            .run(did, move || async move { batcher.add(&key).await }.boxed())
            .await;

        match result {
            Ok(profile) => Ok(profile),
            Err(e) if e.is_profile_missing() => {
                debug!(did, "Profile gone upstream");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Look up a post by AT-URI. `Ok(None)` means the post no longer exists
    /// upstream.
    pub async fn get_post(&self, uri: &str) -> Result<Option<PostView>, IndexerError> {
        let batcher = self.post_batcher.clone();
        let key = uri.to_string();
        self.post_flights
            .run(uri, move || async move { batcher.add(&key).await }.boxed())
            .await
    }
}

async fn fetch_profiles(
    http: &HttpClient,
    base_url: &str,
    limiter: &RateLimiter,
    dids: Vec<String>,
) -> Result<HashMap<String, ProfileView>, IndexerError> {
    let url = format!("{}/xrpc/app.bsky.actor.getProfiles", base_url);
    let params: Vec<(&str, &str)> = dids.iter().map(|d| ("actors", d.as_str())).collect();

    let response: GetProfilesResponse = limiter
        .schedule("app.bsky.actor.getProfiles", || {
            let request = http.get(&url).query(&params);
            async move {
                let response = request.send().await?;
                let response = check_status(response).await?;
                Ok(response.json().await?)
            }
        })
        .await?;

    Ok(response
        .profiles
        .into_iter()
        .map(|p| (p.did.clone(), p))
        .collect())
}

async fn fetch_posts(
    http: &HttpClient,
    base_url: &str,
    limiter: &RateLimiter,
    uris: Vec<String>,
) -> Result<HashMap<String, PostView>, IndexerError> {
    let url = format!("{}/xrpc/app.bsky.feed.getPosts", base_url);
    let params: Vec<(&str, &str)> = uris.iter().map(|u| ("uris", u.as_str())).collect();

    let response: GetPostsResponse = limiter
        .schedule("app.bsky.feed.getPosts", || {
            let request = http.get(&url).query(&params);
            async move {
                let response = request.send().await?;
                let response = check_status(response).await?;
                Ok(response.json().await?)
            }
        })
        .await?;

    Ok(response
        .posts
        .into_iter()
        .map(|p| (p.uri.clone(), p))
        .collect())
}

/// Map non-2xx responses into `IndexerError::Api`, carrying the rate-limit
/// headers the limiter's failure policy inspects.
async fn check_status(response: Response) -> Result<Response, IndexerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };
    let ratelimit_remaining = header("ratelimit-remaining");
    let ratelimit_reset = header("ratelimit-reset").and_then(|v| v.parse::<i64>().ok());
    let message = response.text().await.unwrap_or_default();

    Err(IndexerError::Api {
        status: status.as_u16(),
        message,
        ratelimit_remaining,
        ratelimit_reset,
    })
}
