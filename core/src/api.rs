//! REST collaborator: the data service behind calls and threads.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

/// Persistence and lookup operations the real-time layer depends on.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn create_call_record(&self, callee_id: &str, call_type: CallType) -> Result<CallRecord>;

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message>;

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>>;

    async fn list_threads(&self) -> Result<Vec<MessageThread>>;

    /// Returns the server's read timestamp.
    async fn mark_read(&self, thread_id: &str, message_id: &str) -> Result<DateTime<Utc>>;

    async fn react(&self, message_id: &str, emoji: &str) -> Result<()>;

    async fn unreact(&self, message_id: &str) -> Result<()>;

    /// Relationship between the current user and `user_id`.
    async fn relationship(&self, user_id: &str) -> Result<Relationship>;

    async fn create_thread(&self, peer_id: &str, is_request: bool) -> Result<MessageThread>;

    async fn accept_request(&self, thread_id: &str) -> Result<()>;

    async fn reject_request(&self, thread_id: &str) -> Result<()>;

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>>;

    /// Stores a blob and returns its public URL.
    async fn upload_media(&self, data: Bytes, file_name: &str, mime_type: &str) -> Result<String>;
}

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadResponse {
    read_at: DateTime<Utc>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.lock().as_ref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        let resp = self.authorized(req).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(Error::NotFound(what.to_string())),
            StatusCode::FORBIDDEN => Err(Error::RequestPolicyDenied(what.to_string())),
            s => Err(Error::Http(format!("{} returned {}", what, s))),
        }
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        Ok(self.execute(req, what).await?.json().await?)
    }

    pub async fn check_health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }

    /// ICE servers advertised by the relay.
    pub async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        self.json(self.client.get(self.url("ice-servers")), "ice servers")
            .await
    }
}

#[async_trait]
impl DataService for ApiClient {
    async fn create_call_record(&self, callee_id: &str, call_type: CallType) -> Result<CallRecord> {
        let req = self
            .client
            .post(self.url("calls"))
            .json(&json!({ "calleeId": callee_id, "callType": call_type }));
        self.json(req, "call record").await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<Message> {
        let req = self
            .client
            .post(self.url(&format!("threads/{}/messages", message.thread_id)))
            .json(message);
        self.json(req, &message.thread_id).await
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let req = self
            .client
            .get(self.url(&format!("threads/{}/messages", thread_id)));
        self.json(req, thread_id).await
    }

    async fn list_threads(&self) -> Result<Vec<MessageThread>> {
        self.json(self.client.get(self.url("threads")), "threads")
            .await
    }

    async fn mark_read(&self, thread_id: &str, message_id: &str) -> Result<DateTime<Utc>> {
        let req = self.client.post(self.url(&format!(
            "threads/{}/messages/{}/read",
            thread_id, message_id
        )));
        let resp: ReadResponse = self.json(req, message_id).await?;
        Ok(resp.read_at)
    }

    async fn react(&self, message_id: &str, emoji: &str) -> Result<()> {
        let req = self
            .client
            .put(self.url(&format!("messages/{}/reaction", message_id)))
            .json(&json!({ "emoji": emoji }));
        self.execute(req, message_id).await?;
        Ok(())
    }

    async fn unreact(&self, message_id: &str) -> Result<()> {
        let req = self
            .client
            .delete(self.url(&format!("messages/{}/reaction", message_id)));
        self.execute(req, message_id).await?;
        Ok(())
    }

    async fn relationship(&self, user_id: &str) -> Result<Relationship> {
        let req = self
            .client
            .get(self.url(&format!("users/{}/relationship", user_id)));
        self.json(req, user_id).await
    }

    async fn create_thread(&self, peer_id: &str, is_request: bool) -> Result<MessageThread> {
        let req = self
            .client
            .post(self.url("threads"))
            .json(&json!({ "peerId": peer_id, "isRequest": is_request }));
        self.json(req, peer_id).await
    }

    async fn accept_request(&self, thread_id: &str) -> Result<()> {
        let req = self
            .client
            .post(self.url(&format!("threads/{}/accept", thread_id)));
        self.execute(req, thread_id).await?;
        Ok(())
    }

    async fn reject_request(&self, thread_id: &str) -> Result<()> {
        let req = self
            .client
            .post(self.url(&format!("threads/{}/reject", thread_id)));
        self.execute(req, thread_id).await?;
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        let req = self
            .client
            .get(self.url("users/search"))
            .query(&[("q", query)]);
        self.json(req, "user search").await
    }

    async fn upload_media(&self, data: Bytes, file_name: &str, mime_type: &str) -> Result<String> {
        let part = reqwest::multipart::Part::stream(data)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| Error::UploadFailure(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let req = self.client.post(self.url("media")).multipart(form);
        let resp: UploadResponse = self
            .json(req, file_name)
            .await
            .map_err(|e| Error::UploadFailure(e.to_string()))?;
        Ok(resp.url)
    }
}
