use std::collections::HashMap;
use std::time::Duration;

use archive_core::fetcher::{PostPageSource, PostsPage, PostsPageRequest};
use archive_core::{Channel, Emoji, Id, Post, Team, User};
use log::debug;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::error::ClientError;

/// Caches entities the client has already looked up. A server client owns
/// exactly one of these, never shared across clients.
#[derive(Debug, Default)]
struct EntityCache {
    users: HashMap<Id, User>,
    teams: HashMap<Id, Team>,
    emojis: HashMap<Id, Emoji>,
    all_emojis_loaded: bool,
}

/// Talks to one Mattermost-style server. Owns the bearer token, the path
/// context (`userId`/`teamId`/`channelId` substituted into endpoint
/// templates), and the per-run entity cache.
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    context: HashMap<&'static str, String>,
    cache: EntityCache,
    throttle: Duration,
    local_user_id: Option<Id>,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client, throttle: Duration) -> ServerClient {
        ServerClient {
            http,
            base_url: base_url.into(),
            token: None,
            context: HashMap::new(),
            cache: EntityCache::default(),
            throttle,
            local_user_id: None,
        }
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn local_user_id(&self) -> Option<&Id> {
        self.local_user_id.as_ref()
    }

    fn substitute(&self, template: &str) -> String {
        let mut path = template.to_string();
        for (key, value) in &self.context {
            path = path.replace(&format!("{{{key}}}"), value);
        }
        path
    }

    /// Sleeps `throttlingLoopDelay` between page fetches. A no-op when the
    /// configured throttle is zero.
    pub async fn delay(&self) {
        if !self.throttle.is_zero() {
            tokio::time::sleep(self.throttle).await;
        }
    }

    async fn request_raw(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        auth_header: &'static str,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        debug!("{method} {url}");

        let mut request = self.http.request(method, &url).query(query);
        if let Some(token) = &self.token {
            request = request.header(auth_header, format!("Bearer {token}"));
            if auth_header != "Authorization" {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| ClientError::RequestExecute {
            endpoint: path.to_string(),
            source,
        })?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    let msg = v.get("message").and_then(Value::as_str).map(str::to_string);
                    let detail = v.get("detailed_error").and_then(Value::as_str).map(str::to_string);
                    match (msg, detail) {
                        (Some(m), Some(d)) => Some(format!("{m} ({d})")),
                        (Some(m), None) => Some(m),
                        (None, Some(d)) => Some(d),
                        (None, None) => None,
                    }
                })
                .unwrap_or(body);
            return Err(ClientError::ServerRejected {
                endpoint: path.to_string(),
                status,
                message,
            });
        }

        let text = response.text().await.map_err(|source| ClientError::ResponseBody {
            endpoint: path.to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ClientError::Deserialize {
            endpoint: path.to_string(),
            source,
        })
    }

    /// `GET` without context-template substitution.
    pub async fn get_raw(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ClientError> {
        self.request_raw(Method::GET, path, query, "Authorization", None).await
    }

    /// `GET` with `{userId}`/`{teamId}`/`{channelId}` substituted from the
    /// client's context before the request is issued.
    pub async fn get(&self, template: &str, query: &[(&str, String)]) -> Result<Value, ClientError> {
        let path = self.substitute(template);
        self.get_raw(&path, query).await
    }

    /// Only ever used for the login call: a non-200 here means the
    /// credentials themselves were rejected, not a generic request failure,
    /// so it's reported as [`ClientError::AuthenticationRejected`] rather
    /// than the catch-all `ServerRejected`.
    async fn post_raw(&self, path: &str, body: &Value, auth_header: &'static str) -> Result<(Value, reqwest::header::HeaderMap), ClientError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.header(auth_header, token.clone());
        }
        let response = request.send().await.map_err(|source| ClientError::RequestExecute {
            endpoint: path.to_string(),
            source,
        })?;
        if response.status() != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(body);
            return Err(ClientError::AuthenticationRejected(message));
        }
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|source| ClientError::ResponseBody {
            endpoint: path.to_string(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| ClientError::Deserialize {
            endpoint: path.to_string(),
            source,
        })?;
        Ok((value, headers))
    }

    /// Logs in with username/password and stores the bearer token the
    /// server returns in its `Token` response header (not the JSON body).
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        let body = serde_json::json!({ "login_id": username, "password": password });
        let (_, headers) = self.post_raw("users/login", &body, "Token").await?;
        let token = headers
            .get("Token")
            .and_then(|v| v.to_str().ok())
            .ok_or(ClientError::MissingTokenHeader)?
            .to_string();
        self.token = Some(token);
        Ok(())
    }

    pub async fn load_local_user(&mut self, username: &str) -> Result<(), ClientError> {
        let user = self.get_user_by_name(username).await?.clone();
        self.context.insert("userId", user.id.as_str().to_string());
        self.local_user_id = Some(user.id);
        Ok(())
    }

    pub async fn get_user_by_id(&mut self, id: &Id) -> Result<&User, ClientError> {
        if !self.cache.users.contains_key(id) {
            let raw = self.get_raw(&format!("users/{id}"), &[]).await?;
            let user = User::from_server(raw)?;
            self.cache.users.insert(id.clone(), user);
        }
        Ok(self.cache.users.get(id).expect("just inserted"))
    }

    pub async fn get_user_by_name(&mut self, name: &str) -> Result<&User, ClientError> {
        if let Some(id) = self.cache.users.values().find(|u| u.name == name).map(|u| u.id.clone()) {
            return Ok(self.cache.users.get(&id).expect("just looked up"));
        }
        let raw = self.get_raw(&format!("users/username/{name}"), &[]).await?;
        let user = User::from_server(raw)?;
        let id = user.id.clone();
        self.cache.users.insert(id.clone(), user);
        Ok(self.cache.users.get(&id).expect("just inserted"))
    }

    /// Loads (if not already cached) and returns the number of teams the
    /// local user is a member of. Iterate with [`teams`](Self::teams) for
    /// the entities themselves.
    pub async fn get_teams(&mut self) -> Result<usize, ClientError> {
        if self.cache.teams.is_empty() {
            let raw = self.get("users/{userId}/teams", &[]).await?;
            let Value::Array(items) = raw else {
                return Err(ClientError::Deserialize {
                    endpoint: "users/{userId}/teams".to_string(),
                    source: serde::de::Error::custom("expected a JSON array"),
                });
            };
            for item in items {
                let team = Team::from_server(item)?;
                self.cache.teams.insert(team.id.clone(), team);
            }
        }
        Ok(self.cache.teams.len())
    }

    pub fn teams(&self) -> impl Iterator<Item = &Team> {
        self.cache.teams.values()
    }

    pub fn teams_mut(&mut self) -> impl Iterator<Item = &mut Team> {
        self.cache.teams.values_mut()
    }

    pub fn get_team_by_id(&self, id: &Id) -> Option<&Team> {
        self.cache.teams.get(id)
    }

    pub fn get_team_by_internal_name(&self, name: &str) -> Option<&Team> {
        self.cache.teams.values().find(|t| t.internal_name == name)
    }

    pub fn get_team_by_name(&self, name: &str) -> Option<&Team> {
        self.cache.teams.values().find(|t| t.name == name)
    }

    pub async fn load_channels(&mut self, team_id: &Id) -> Result<(), ClientError> {
        self.context.insert("teamId", team_id.as_str().to_string());
        let raw = self.get("users/{userId}/teams/{teamId}/channels", &[]).await?;
        let Value::Array(items) = raw else {
            return Err(ClientError::Deserialize {
                endpoint: "users/{userId}/teams/{teamId}/channels".to_string(),
                source: serde::de::Error::custom("expected a JSON array"),
            });
        };
        let team = self
            .cache
            .teams
            .get_mut(team_id)
            .ok_or_else(|| ClientError::UnknownTeam(team_id.to_string()))?;
        for item in items {
            let channel = Channel::from_server(item)?;
            team.channels.insert(channel.id.clone(), channel);
        }
        Ok(())
    }

    pub async fn load_channel_members(&mut self, team_id: &Id, channel_id: &Id) -> Result<(), ClientError> {
        self.context.insert("teamId", team_id.as_str().to_string());
        let mut members = Vec::new();
        let mut page = 0usize;
        loop {
            let raw = self
                .get_raw(
                    &format!("channels/{channel_id}/members"),
                    &[("page", page.to_string()), ("per_page", "100".to_string())],
                )
                .await?;
            let Value::Array(items) = raw else { break };
            let count = items.len();
            for item in items {
                let user_id: Id = item
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map(|s| Id(s.to_string()))
                    .ok_or(ClientError::MissingTokenHeader)?;
                let user = self.get_user_by_id(&user_id).await?.clone();
                members.push(user);
            }
            if count < 100 {
                break;
            }
            page += 1;
        }
        if let Some(team) = self.cache.teams.get_mut(team_id) {
            if let Some(channel) = team.channels.get_mut(channel_id) {
                channel.members = members;
            }
        }
        Ok(())
    }

    pub async fn get_post_by_id(&self, post_id: &Id) -> Result<Post, ClientError> {
        let raw = self.get_raw(&format!("posts/{post_id}"), &[]).await?;
        Ok(Post::from_server(raw)?)
    }

    pub async fn get_emoji_by_id(&mut self, id: &Id) -> Result<&Emoji, ClientError> {
        if !self.cache.emojis.contains_key(id) {
            let raw = self.get_raw(&format!("emoji/{id}"), &[]).await?;
            let emoji = Emoji::from_server(raw)?;
            self.cache.emojis.insert(id.clone(), emoji);
        }
        Ok(self.cache.emojis.get(id).expect("just inserted"))
    }

    /// There is no single-emoji-by-name endpoint, so a cache miss loads the
    /// entire emoji list once.
    pub async fn get_emoji_by_name(&mut self, name: &str) -> Result<&Emoji, ClientError> {
        if !self.cache.emojis.values().any(|e| e.name == name) {
            self.load_all_emojis().await?;
        }
        self.cache
            .emojis
            .values()
            .find(|e| e.name == name)
            .map(|e| e.id.clone())
            .and_then(|id| self.cache.emojis.get(&id))
            .ok_or_else(|| ClientError::UnknownUser(name.to_string()))
    }

    pub async fn load_all_emojis(&mut self) -> Result<(), ClientError> {
        if self.cache.all_emojis_loaded {
            return Ok(());
        }
        let mut page = 0usize;
        loop {
            let raw = self
                .get_raw("emoji", &[("page", page.to_string()), ("per_page", "200".to_string())])
                .await?;
            let Value::Array(items) = raw else { break };
            let count = items.len();
            for item in items {
                let emoji = Emoji::from_server(item)?;
                self.cache.emojis.insert(emoji.id.clone(), emoji);
            }
            if count < 200 {
                break;
            }
            page += 1;
        }
        self.cache.all_emojis_loaded = true;
        Ok(())
    }

    pub fn emoji_image_url(&self, emoji_id: &Id) -> String {
        format!("{}/emoji/{emoji_id}/image", self.base_url.trim_end_matches('/'))
    }

    pub fn file_url(&self, file_id: &Id, public: bool) -> String {
        if public {
            format!("{}/files/{file_id}/link", self.base_url.trim_end_matches('/'))
        } else {
            format!("{}/files/{file_id}", self.base_url.trim_end_matches('/'))
        }
    }

    pub fn avatar_url(&self, user_id: &Id) -> String {
        format!("{}/users/{user_id}/image", self.base_url.trim_end_matches('/'))
    }

    /// Issues an authenticated `GET` against an absolute URL built by
    /// [`Self::emoji_image_url`], [`Self::file_url`], or [`Self::avatar_url`]
    /// and returns the raw response for the caller to stream to disk.
    pub async fn download(&self, url: &str) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().await.map_err(|source| ClientError::RequestExecute {
            endpoint: url.to_string(),
            source,
        })?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::ServerRejected {
                endpoint: url.to_string(),
                status: response.status(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    async fn fetch_posts_page_impl(&self, channel_id: &Id, request: &PostsPageRequest) -> Result<PostsPage, ClientError> {
        let mut query: Vec<(&str, String)> = vec![("per_page", request.per_page.to_string())];
        if let Some(page) = request.page {
            query.push(("page", page.to_string()));
        }
        if let Some(after) = &request.after {
            query.push(("after", after.as_str().to_string()));
        }
        if let Some(before) = &request.before {
            query.push(("before", before.as_str().to_string()));
        }

        let raw = self.get_raw(&format!("channels/{channel_id}/posts"), &query).await?;

        let order: Vec<Id> = raw
            .get("order")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|s| Id(s.to_string()))
            .collect();

        let mut posts = HashMap::new();
        if let Some(Value::Object(map)) = raw.get("posts").cloned() {
            for (id, body) in map {
                posts.insert(Id(id), Post::from_server(body)?);
            }
        }

        let non_empty = |key: &str| -> Option<Id> {
            raw.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(|s| Id(s.to_string()))
        };

        Ok(PostsPage {
            order,
            posts,
            next_post_id: Some(non_empty("next_post_id").unwrap_or(Id(String::new()))),
            prev_post_id: Some(non_empty("prev_post_id").unwrap_or(Id(String::new()))),
        })
    }
}

/// Drives [`archive_core::fetcher::fetch_posts`] against the real server:
/// `channels/{channelId}/posts` is the only endpoint the fetcher's hot loop
/// touches, so this is the sole `PostPageSource` the crate exposes. Tests in
/// `archive-core` implement the same trait against canned fixtures instead.
impl PostPageSource for ServerClient {
    type Error = ClientError;

    async fn fetch_posts_page(&mut self, channel_id: &Id, request: &PostsPageRequest) -> Result<PostsPage, ClientError> {
        let page = self.fetch_posts_page_impl(channel_id, request).await?;
        self.delay().await;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ServerClient {
        ServerClient::new("https://chat.example.com", reqwest::Client::new(), Duration::ZERO)
    }

    #[test]
    fn url_builders_trim_trailing_slash_on_the_base() {
        let mut c = client();
        c.base_url = "https://chat.example.com/".to_string();
        assert_eq!(c.emoji_image_url(&Id("e1".into())), "https://chat.example.com/emoji/e1/image");
        assert_eq!(c.file_url(&Id("f1".into()), false), "https://chat.example.com/files/f1");
        assert_eq!(c.file_url(&Id("f1".into()), true), "https://chat.example.com/files/f1/link");
        assert_eq!(c.avatar_url(&Id("u1".into())), "https://chat.example.com/users/u1/image");
    }

    #[test]
    fn substitute_replaces_known_context_placeholders_only() {
        let mut c = client();
        c.context.insert("userId", "u1".to_string());
        assert_eq!(c.substitute("users/{userId}/teams/{teamId}/channels"), "users/u1/teams/{teamId}/channels");
    }
}
