use serde::Deserialize;
use yt_oauth::{AuthenticatedClient, OAuthClient};

/// Default YouTube Data API host
pub const DEFAULT_API_ADDRESS: &str = "https://www.googleapis.com";

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Channel owned by the authenticated user
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub snippet: ChannelSnippet,
    pub content_details: ChannelContentDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSnippet {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelContentDetails {
    pub related_playlists: RelatedPlaylists,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelatedPlaylists {
    /// Playlist holding every upload of the channel
    pub uploads: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    snippet: PlaylistItemSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemSnippet {
    title: String,
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: String,
}

/// Uploaded video, as listed in the channel's uploads playlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub id: String,
    pub title: String,
}

/// Read-only YouTube Data API calls on behalf of the authenticated user
pub struct YouTubeApi<'a, C> {
    auth: &'a AuthenticatedClient<C>,
    http: reqwest::Client,
    api_address: String,
}

impl<'a, C: OAuthClient> YouTubeApi<'a, C> {
    pub fn new(auth: &'a AuthenticatedClient<C>, api_address: impl Into<String>) -> Self {
        Self::with_http_client(auth, api_address, reqwest::Client::new())
    }

    pub fn with_http_client(
        auth: &'a AuthenticatedClient<C>,
        api_address: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            auth,
            http,
            api_address: api_address.into().trim_end_matches('/').to_string(),
        }
    }

    async fn list<T: for<'de> Deserialize<'de>>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, Box<dyn std::error::Error>> {
        let access_token = self.auth.access_token().await?;
        let url = format!("{}/youtube/v3/{}", self.api_address, resource);

        let response = self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            return Err(format!("Failed to list {} (status {}): {}", resource, status, body).into());
        }

        let body: ListResponse<T> = response.json().await?;
        Ok(body.items)
    }

    /// The authenticated user's channel
    pub async fn channel(&self) -> Result<Channel, Box<dyn std::error::Error>> {
        let channels: Vec<Channel> = self
            .list(
                "channels",
                &[("part", "snippet,contentDetails"), ("mine", "true")],
            )
            .await?;
        channels
            .into_iter()
            .next()
            .ok_or_else(|| "No channel found for the authenticated user".into())
    }

    /// Videos in the channel's uploads playlist, newest first
    pub async fn uploaded_videos(
        &self,
        max_results: u32,
    ) -> Result<Vec<Video>, Box<dyn std::error::Error>> {
        let channel = self.channel().await?;
        let max_results = max_results.to_string();

        let items: Vec<PlaylistItem> = self
            .list(
                "playlistItems",
                &[
                    ("part", "snippet"),
                    ("playlistId", channel.content_details.related_playlists.uploads.as_str()),
                    ("maxResults", max_results.as_str()),
                ],
            )
            .await?;

        Ok(items
            .into_iter()
            .map(|item| Video {
                id: item.snippet.resource_id.video_id,
                title: item.snippet.title,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use yt_oauth::{AuthorizationCoordinator, ClientConfig, Credentials, GoogleOAuthClient, TokenStore};

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some("Bearer A1")
    }

    async fn channels(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({})));
        }
        assert_eq!(query.get("mine").map(String::as_str), Some("true"));
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": [{
                    "id": "UC123",
                    "snippet": {"title": "My Channel"},
                    "contentDetails": {"relatedPlaylists": {"uploads": "UU123"}}
                }]
            })),
        )
    }

    async fn playlist_items(
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if !authorized(&headers) || query.get("playlistId").map(String::as_str) != Some("UU123") {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({})));
        }
        assert_eq!(query.get("maxResults").map(String::as_str), Some("50"));
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": [
                    {"snippet": {"title": "First", "resourceId": {"videoId": "v1"}}},
                    {"snippet": {"title": "Second", "resourceId": {"videoId": "v2"}}}
                ]
            })),
        )
    }

    async fn fake_api() -> String {
        let app = Router::new()
            .route("/youtube/v3/channels", get(channels))
            .route("/youtube/v3/playlistItems", get(playlist_items));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn authenticated(
        dir: &tempfile::TempDir,
        access_token: &str,
    ) -> AuthenticatedClient<GoogleOAuthClient> {
        let store = TokenStore::new(dir.path().join("token.json"));
        // No expiry, so the client never tries to refresh
        store.save(&Credentials::new(access_token)).unwrap();

        let config = ClientConfig::from_json(
            r#"{"installed": {"client_id": "X", "client_secret": "Y",
                "redirect_uris": ["http://localhost:8080/cb"]}}"#,
        )
        .unwrap();
        AuthorizationCoordinator::new(store)
            .obtain_google_client(&config)
            .await
            .unwrap()
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn lists_channel_of_authenticated_user() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticated(&dir, "A1").await;
        let api = YouTubeApi::with_http_client(&auth, fake_api().await, http());

        let channel = api.channel().await.unwrap();
        assert_eq!(channel.id, "UC123");
        assert_eq!(channel.snippet.title, "My Channel");
        assert_eq!(channel.content_details.related_playlists.uploads, "UU123");
    }

    #[tokio::test]
    async fn lists_uploaded_videos() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticated(&dir, "A1").await;
        let api = YouTubeApi::with_http_client(&auth, fake_api().await, http());

        let videos = api.uploaded_videos(50).await.unwrap();
        assert_eq!(
            videos,
            vec![
                Video {
                    id: "v1".to_string(),
                    title: "First".to_string()
                },
                Video {
                    id: "v2".to_string(),
                    title: "Second".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn api_errors_carry_status() {
        let dir = tempfile::tempdir().unwrap();
        let auth = authenticated(&dir, "WRONG").await;
        let api = YouTubeApi::with_http_client(&auth, fake_api().await, http());

        let err = api.channel().await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
