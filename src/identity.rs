//! Test-user fixtures against a Supabase-compatible auth service.
//!
//! The admin side recreates a user with a known password and signs in to
//! obtain a session. The page side writes that session where the app's
//! client library looks for it, either `localStorage` or cookies.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{self as json, json};
use tokio::time::sleep;
use url::Url;

use crate::browser::page::PageDriver;

pub const COOKIE_CHUNK_SIZE: usize = 3180;
const MAX_COOKIE_CHUNKS: usize = 10;
const AUTH_SETTLE: Duration = Duration::from_millis(1000);
const SIGN_OUT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum StorageType {
    #[default]
    #[serde(rename = "localStorage")]
    LocalStorage,
    #[serde(rename = "cookie")]
    Cookie,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    pub url: String,
    pub service_role_key: String,
    pub anon_key: String,
    pub storage_key: String,
    #[serde(default)]
    pub storage_type: StorageType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestUser {
    pub email: String,
    pub password: String,
    pub metadata: json::Map<String, json::Value>,
}

#[allow(async_fn_in_trait)]
pub trait IdentityProvider {
    /// Creates a confirmed user, replacing any existing one with the same
    /// email.
    async fn create_test_user(&self, user: &TestUser) -> Result<()>;

    /// Returns the session object the client library persists.
    async fn sign_in(&self, email: &str, password: &str) -> Result<json::Value>;
}

#[derive(Deserialize)]
struct AdminUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<AdminUser>,
}

pub struct SupabaseAdmin {
    client: Client,
    base: Url,
    service_role_key: String,
    anon_key: String,
}

impl SupabaseAdmin {
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .with_context(|| format!("invalid identity url {}", config.url))?;
        Ok(SupabaseAdmin {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            base,
            service_role_key: config.service_role_key.clone(),
            anon_key: config.anon_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn admin(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }

    async fn find_user(&self, email: &str) -> Result<Option<AdminUser>> {
        let mut url = self.endpoint("auth/v1/admin/users")?;
        url.query_pairs_mut().append_pair("per_page", "1000");
        let response = self.admin(self.client.get(url)).send().await?;
        let list: UserList = checked(response, "list users").await?.json().await?;
        Ok(list
            .users
            .into_iter()
            .find(|user| user.email.as_deref() == Some(email)))
    }

    async fn upsert_profile(
        &self,
        id: &str,
        metadata: &json::Map<String, json::Value>,
    ) -> Result<()> {
        let mut row = metadata.clone();
        row.insert("id".to_string(), json::Value::String(id.to_string()));
        let response = self
            .admin(self.client.post(self.endpoint("rest/v1/profiles")?))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&row)
            .send()
            .await?;
        checked(response, "profile upsert").await?;
        Ok(())
    }
}

impl IdentityProvider for SupabaseAdmin {
    async fn create_test_user(&self, user: &TestUser) -> Result<()> {
        if let Some(existing) = self.find_user(&user.email).await? {
            debug!("deleting existing user {}", user.email);
            let url = self
                .endpoint(&format!("auth/v1/admin/users/{}", existing.id))?;
            let response = self.admin(self.client.delete(url)).send().await?;
            checked(response, "delete user").await?;
        }

        let response = self
            .admin(self.client.post(self.endpoint("auth/v1/admin/users")?))
            .json(&json!({
                "email": user.email,
                "password": user.password,
                "email_confirm": true,
                "user_metadata": user.metadata,
            }))
            .send()
            .await?;
        let created: AdminUser = checked(response, "Failed to create user")
            .await?
            .json()
            .await?;
        info!("created test user {}", user.email);

        if user.metadata.contains_key("role")
            || user.metadata.contains_key("full_name")
        {
            if let Err(error) =
                self.upsert_profile(&created.id, &user.metadata).await
            {
                warn!("profile upsert warning: {:#}", error);
            }
        }
        Ok(())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<json::Value> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let response = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let mut session: json::Value =
            checked(response, "Failed to sign in").await?.json().await?;
        stamp_expiry(&mut session, chrono::Utc::now().timestamp());
        Ok(session)
    }
}

// The token endpoint returns `expires_in`; stored sessions carry the
// absolute `expires_at` as well.
fn stamp_expiry(session: &mut json::Value, now: i64) {
    let Some(object) = session.as_object_mut() else {
        return;
    };
    if object.contains_key("expires_at") {
        return;
    }
    if let Some(expires_in) = object.get("expires_in").and_then(json::Value::as_i64) {
        object.insert("expires_at".to_string(), json!(now + expires_in));
    }
}

async fn checked(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = json::from_str::<json::Value>(&body)
        .ok()
        .and_then(|value| {
            ["msg", "message", "error_description", "error"]
                .iter()
                .find_map(|key| value.get(key)?.as_str().map(str::to_string))
        })
        .unwrap_or(body);
    Err(anyhow!("{}: {} ({})", operation, message, status))
}

const SET_LOCAL_STORAGE: &str =
    "(key, value) => localStorage.setItem(key, value)";
const REMOVE_LOCAL_STORAGE: &str = "(key) => localStorage.removeItem(key)";
const SET_COOKIE: &str =
    "(name, value) => { document.cookie = `${name}=${value}; path=/; SameSite=Lax;`; }";
const CLEAR_COOKIES: &str = "(names) => {
  for (const name of names) {
    document.cookie = `${name}=; path=/; expires=Thu, 01 Jan 1970 00:00:00 GMT;`;
  }
}";

// `urlencoding` escapes everything but `A-Za-z0-9-._~`. Browsers leave
// `!*'()` alone as well.
const URI_COMPONENT_RESERVED: [(&str, &str); 5] =
    [("%21", "!"), ("%2A", "*"), ("%27", "'"), ("%28", "("), ("%29", ")")];

/// Percent-encodes `text` with the escape set of `encodeURIComponent`.
pub fn encode_uri_component(text: &str) -> String {
    // Every `%` in the output starts an escape, so these never overlap.
    URI_COMPONENT_RESERVED
        .iter()
        .fold(urlencoding::encode(text).into_owned(), |encoded, (escape, raw)| {
            encoded.replace(escape, raw)
        })
}

/// Cookie name/value pairs holding a URI-encoded session. A single chunk is
/// stored under `key`, several under `key.0`, `key.1`, and so on.
pub fn session_cookies(key: &str, session: &str) -> Vec<(String, String)> {
    let encoded = encode_uri_component(session);
    // Percent-encoded text is ASCII, so byte chunks are char boundaries.
    let chunks: Vec<&str> = encoded
        .as_bytes()
        .chunks(COOKIE_CHUNK_SIZE)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    if chunks.len() == 1 {
        return vec![(key.to_string(), chunks[0].to_string())];
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| (format!("{}.{}", key, index), chunk.to_string()))
        .collect()
}

fn session_cookie_names(key: &str) -> Vec<String> {
    std::iter::once(key.to_string())
        .chain((0..MAX_COOKIE_CHUNKS).map(|index| format!("{}.{}", key, index)))
        .collect()
}

/// Signs test users in and out of the app under test.
pub struct Identity<I> {
    provider: I,
    config: IdentityConfig,
    origin: Url,
    navigation_timeout: Duration,
}

impl<I: IdentityProvider> Identity<I> {
    pub fn new(
        provider: I,
        config: IdentityConfig,
        origin: Url,
        navigation_timeout: Duration,
    ) -> Self {
        Identity {
            provider,
            config,
            origin,
            navigation_timeout,
        }
    }

    pub async fn authenticate<P: PageDriver>(
        &self,
        page: &P,
        user: &TestUser,
    ) -> Result<()> {
        self.provider.create_test_user(user).await?;
        let session = self.provider.sign_in(&user.email, &user.password).await?;
        let session = json::to_string(&session)?;

        self.ensure_on_app_origin(page).await?;
        let key = &self.config.storage_key;
        match self.config.storage_type {
            StorageType::LocalStorage => {
                page.evaluate(
                    SET_LOCAL_STORAGE,
                    vec![json!(key), json!(session)],
                )
                .await?;
            }
            StorageType::Cookie => {
                clear_cookies(page, key).await?;
                for (name, value) in session_cookies(key, &session) {
                    page.evaluate(SET_COOKIE, vec![json!(name), json!(value)])
                        .await?;
                }
            }
        }

        page.reload(self.navigation_timeout).await?;
        sleep(AUTH_SETTLE).await;
        Ok(())
    }

    pub async fn sign_out<P: PageDriver>(&self, page: &P) -> Result<()> {
        self.ensure_on_app_origin(page).await?;
        let key = &self.config.storage_key;
        match self.config.storage_type {
            StorageType::LocalStorage => {
                page.evaluate(REMOVE_LOCAL_STORAGE, vec![json!(key)]).await?;
            }
            StorageType::Cookie => clear_cookies(page, key).await?,
        }
        page.reload(self.navigation_timeout).await?;
        sleep(SIGN_OUT_SETTLE).await;
        Ok(())
    }

    async fn ensure_on_app_origin<P: PageDriver>(&self, page: &P) -> Result<()> {
        let current = page.current_url().await?;
        if current.is_empty() || current == "about:blank" {
            page.goto(&self.origin, self.navigation_timeout).await?;
        }
        Ok(())
    }
}

async fn clear_cookies<P: PageDriver>(page: &P, key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("identity storageKey is empty");
    }
    page.evaluate(CLEAR_COOKIES, vec![json!(session_cookie_names(key))])
        .await?;
    Ok(())
}
