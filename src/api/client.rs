use async_trait::async_trait;
use log::debug;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::api::models::{
    ConversationKey, Message, MessageRow, NewMessage, Profile, SenderActivity, Session, UserId,
};
use crate::chat::store::{MessageStore, ProfileDirectory};
use crate::error::{ChatError, Result};
use crate::utils::normalize_url;

const PROFILE_COLUMNS: &str = "id,email,full_name";

/// Client for the hosted backend's REST surface (PostgREST plus auth).
pub struct ApiClient {
    http: HttpClient,
    base: Url,
    anon_key: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: UserId,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    user: AuthUser,
}

impl ApiClient {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let normalized = normalize_url(base_url);
        let base = Url::parse(&format!("{}/", normalized.trim_end_matches('/')))?;
        Ok(Self {
            http: HttpClient::new(),
            base,
            anon_key: anon_key.to_string(),
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn rest(&self, table: &str) -> Result<Url> {
        self.endpoint(&format!("rest/v1/{}", table))
    }

    /// Every request carries the project key; the bearer is the user's token
    /// when signed in, the project key otherwise.
    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        req.header("apikey", &self.anon_key).bearer_auth(bearer)
    }

    async fn checked(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ChatError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, &str)]) -> Result<T> {
        let resp = self.with_auth(self.http.get(url).query(query)).send().await?;
        Ok(Self::checked(resp).await?.json::<T>().await?)
    }

    /// Password sign-in. The returned session carries the access token used
    /// for every later request.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let url = self.endpoint("auth/v1/token")?;
        let body = serde_json::json!({ "email": email, "password": password });
        let req = self
            .http
            .post(url)
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&body);
        let resp = Self::checked(req.send().await?).await?;
        let auth: AuthResponse = resp.json().await?;
        debug!("signed in as {}", auth.user.id);
        Ok(Session {
            user_id: auth.user.id,
            email: auth.user.email.or_else(|| Some(email.to_string())),
            access_token: Some(auth.access_token),
        })
    }
}

/// PostgREST `or` filter matching the pair in either direction.
pub(crate) fn conversation_filter(key: &ConversationKey) -> String {
    let (a, b) = (&key.viewer, &key.counterparty);
    format!(
        "(and(sender_id.eq.{a},receiver_id.eq.{b}),and(sender_id.eq.{b},receiver_id.eq.{a}))"
    )
}

pub(crate) fn id_list(ids: &[i64]) -> String {
    let joined: Vec<String> = ids.iter().map(i64::to_string).collect();
    format!("in.({})", joined.join(","))
}

#[async_trait]
impl MessageStore for ApiClient {
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let filter = conversation_filter(key);
        let rows: Vec<MessageRow> = self
            .get_json(
                self.rest("messages")?,
                &[
                    ("select", "*"),
                    ("or", filter.as_str()),
                    ("order", "created_at.asc,id.asc"),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn insert(&self, message: &NewMessage) -> Result<Message> {
        let req = self
            .http
            .post(self.rest("messages")?)
            .header("Prefer", "return=representation")
            .json(message);
        let resp = Self::checked(self.with_auth(req).send().await?).await?;
        let rows: Vec<MessageRow> = resp.json().await?;
        rows.into_iter()
            .next()
            .map(Message::from)
            .ok_or(ChatError::EmptyResponse)
    }

    async fn mark_read(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let req = self
            .http
            .patch(self.rest("messages")?)
            .query(&[("id", id_list(ids))])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "is_read": true }));
        Self::checked(self.with_auth(req).send().await?).await?;
        Ok(())
    }

    async fn recent_senders_to(&self, recipient: &UserId) -> Result<Vec<SenderActivity>> {
        let to = format!("eq.{}", recipient);
        let not_from = format!("neq.{}", recipient);
        self.get_json(
            self.rest("messages")?,
            &[
                ("select", "sender_id,created_at,profiles:sender_id(full_name,email,is_admin)"),
                ("receiver_id", to.as_str()),
                ("sender_id", not_from.as_str()),
                ("order", "created_at.desc"),
            ],
        )
        .await
    }
}

#[async_trait]
impl ProfileDirectory for ApiClient {
    async fn find_admin(&self) -> Result<Option<Profile>> {
        let rows: Vec<Profile> = self
            .get_json(
                self.rest("profiles")?,
                &[
                    ("select", PROFILE_COLUMNS),
                    ("is_admin", "eq.true"),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().map(|mut p| {
            p.is_admin = true;
            p
        }))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let filter = format!("eq.{}", email);
        let rows: Vec<Profile> = self
            .get_json(
                self.rest("profiles")?,
                &[
                    ("select", PROFILE_COLUMNS),
                    ("email", filter.as_str()),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ApiClient::new("abcd.supabase.co/", "anon").unwrap();
        assert_eq!(client.base_url().as_str(), "https://abcd.supabase.co/");
        assert_eq!(
            client.rest("messages").unwrap().as_str(),
            "https://abcd.supabase.co/rest/v1/messages"
        );
    }

    #[test]
    fn base_url_keeps_path_prefix() {
        let client = ApiClient::new("http://localhost:54321/proxy", "anon").unwrap();
        assert_eq!(
            client.endpoint("auth/v1/token").unwrap().as_str(),
            "http://localhost:54321/proxy/auth/v1/token"
        );
    }

    #[test]
    fn filter_covers_both_directions() {
        let key = ConversationKey::new(UserId::new("t-1"), UserId::new("a-9"));
        assert_eq!(
            conversation_filter(&key),
            "(and(sender_id.eq.t-1,receiver_id.eq.a-9),and(sender_id.eq.a-9,receiver_id.eq.t-1))"
        );
    }

    #[test]
    fn id_list_uses_in_operator() {
        assert_eq!(id_list(&[3, 5, 8]), "in.(3,5,8)");
    }

    #[test]
    fn auth_response_maps_to_session() {
        let json = r#"{
            "access_token": "jwt",
            "token_type": "bearer",
            "user": { "id": "7c1e", "email": "tenant@example.com", "role": "authenticated" }
        }"#;
        let auth: AuthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(auth.user.id, UserId::new("7c1e"));
        assert_eq!(auth.access_token, "jwt");
    }
}
