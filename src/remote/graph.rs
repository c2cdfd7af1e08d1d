use async_trait::async_trait;
use reqwest::header::IF_MATCH;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

use super::wire::{
    Page, RemoteBucket, RemotePlan, RemotePlanDetails, RemoteTask, RemoteTaskDetails, RemoteUser,
    TaskBoardFormat,
};
use super::{DeltaFetch, PlannerApi, TaskCreate, TaskPatch, WriteOutcome};
use crate::config::GraphConfig;
use crate::error::{Error, Result};
use crate::model::{DeltaCursor, Person};

/// Environment variable holding the bearer token.
pub const TOKEN_ENV: &str = "PLANNERSYNC_TOKEN";

/// Order hint that places a new entry first.
const FIRST_ORDER_HINT: &str = " !";

/// Statuses the delta endpoint answers with once a delta link is no longer
/// valid.
fn is_cursor_rejected(status: u16) -> bool {
    matches!(status, 400 | 404 | 410)
}

/// `PlannerApi` over the Microsoft Graph REST endpoints.
pub struct GraphClient {
    http: reqwest::Client,
    base: Url,
    delta_url: Url,
    token: String,
}

impl GraphClient {
    pub fn new(token: impl Into<String>, config: &GraphConfig) -> Result<Self> {
        let mut base = config.graph_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base: Url::parse(&base)?,
            delta_url: Url::parse(&config.delta_url)?,
            token: token.into(),
        })
    }

    /// Build a client with the token from `PLANNERSYNC_TOKEN`.
    pub fn from_env(config: &GraphConfig) -> Result<Self> {
        let token = std::env::var(TOKEN_ENV)
            .map_err(|_| Error::Config(format!("{TOKEN_ENV} is not set")))?;
        Self::new(token, config)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn api_error(resp: reqwest::Response) -> Error {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Error::Api { status, message }
    }

    /// GET a single resource. 404 maps to `None`.
    async fn get_one<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body = resp.bytes().await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn get_page<T: DeserializeOwned>(&self, url: Url) -> Result<Page<T>> {
        let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// GET a collection, following `@odata.nextLink` to the end.
    async fn get_all<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let page: Page<T> = self.get_page(url).await?;
            items.extend(page.value);
            if let Some(link) = page.next_link {
                next = Some(Url::parse(&link)?);
            }
        }
        Ok(items)
    }

    /// Send a write. Rate limiting and server errors are transport-level
    /// failures; every other non-success status becomes a `WriteOutcome`.
    async fn write(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        etag: Option<&str>,
    ) -> Result<WriteOutcome<Option<Value>>> {
        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(&self.token)
            .header("Prefer", "return=representation");
        if let Some(etag) = etag {
            req = req.header(IF_MATCH, etag);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(WriteOutcome::Applied(None));
            }
            return Ok(WriteOutcome::Applied(Some(serde_json::from_str(&text)?)));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        log::debug!("{method} {url} answered {status}");
        Ok(WriteOutcome::failure(status.as_u16(), text))
    }

    fn person_bind(&self, user_id: &str) -> Result<String> {
        Ok(self.endpoint(&format!("directoryObjects/{user_id}"))?.to_string())
    }
}

/// Minimal view of a freshly created directory object.
#[derive(Deserialize)]
struct Created {
    id: String,
}

fn etag_of(body: &Option<Value>) -> Option<String> {
    body.as_ref()
        .and_then(|v| v.get("@odata.etag"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn with_etag(outcome: WriteOutcome<Option<Value>>) -> WriteOutcome<Option<String>> {
    outcome.map(|body| etag_of(&body))
}

/// Decode the representation returned by a create.
fn decode_created<T: DeserializeOwned>(
    outcome: WriteOutcome<Option<Value>>,
) -> Result<WriteOutcome<T>> {
    match outcome.into_applied() {
        Ok(Some(body)) => Ok(WriteOutcome::Applied(serde_json::from_value(body)?)),
        Ok(None) => Err(Error::Other("create returned an empty body".into())),
        Err(outcome) => Ok(outcome),
    }
}

fn assignment() -> Value {
    json!({
        "@odata.type": "#microsoft.graph.plannerAssignment",
        "orderHint": FIRST_ORDER_HINT,
    })
}

/// Mail nickname for a new group: alphanumerics from the name plus a
/// timestamp suffix so repeated names stay unique.
fn mail_nickname(name: &str) -> String {
    let stem: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(40)
        .collect();
    let stem = if stem.is_empty() { "plan".to_string() } else { stem };
    format!("{stem}{}", chrono::Utc::now().timestamp_millis())
}

pub(crate) fn create_body(task: &TaskCreate) -> Value {
    let assignments: Map<String, Value> = task
        .assignees
        .iter()
        .map(|id| (id.clone(), assignment()))
        .collect();
    let mut body = json!({
        "planId": task.plan_id,
        "bucketId": task.bucket_id,
        "title": task.title,
        "assignments": assignments,
    });
    if let Some(due) = task.due_date {
        body["dueDateTime"] = json!(due);
    }
    if let Some(percent) = task.percent_complete {
        body["percentComplete"] = json!(percent);
    }
    body
}

pub(crate) fn patch_body(patch: &TaskPatch) -> Value {
    let mut body = Map::new();
    if let Some(title) = &patch.title {
        body.insert("title".into(), json!(title));
    }
    if !patch.add_assignees.is_empty() || !patch.remove_assignees.is_empty() {
        let mut assignments = Map::new();
        for id in &patch.remove_assignees {
            assignments.insert(id.clone(), Value::Null);
        }
        for id in &patch.add_assignees {
            assignments.insert(id.clone(), assignment());
        }
        body.insert("assignments".into(), Value::Object(assignments));
    }
    if let Some(due) = patch.due_date {
        body.insert("dueDateTime".into(), json!(due));
    }
    if let Some(percent) = patch.percent_complete {
        body.insert("percentComplete".into(), json!(percent));
    }
    Value::Object(body)
}

#[async_trait]
impl PlannerApi for GraphClient {
    async fn me(&self) -> Result<Person> {
        let user: RemoteUser = self
            .get_one(self.endpoint("me")?)
            .await?
            .ok_or_else(|| Error::NotFound("me".into()))?;
        Ok(user.into())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<Person>> {
        let user: Option<RemoteUser> = self
            .get_one(self.endpoint(&format!("users/{user_id}"))?)
            .await?;
        Ok(user.map(Person::from))
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<RemotePlan>> {
        self.get_one(self.endpoint(&format!("planner/plans/{plan_id}"))?).await
    }

    async fn get_plan_details(&self, plan_id: &str) -> Result<Option<RemotePlanDetails>> {
        self.get_one(self.endpoint(&format!("planner/plans/{plan_id}/details"))?)
            .await
    }

    async fn update_plan_sharing(
        &self,
        plan_id: &str,
        user_ids: &[String],
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let shared: Map<String, Value> = user_ids
            .iter()
            .map(|id| (id.clone(), json!(true)))
            .collect();
        let body = json!({ "sharedWith": shared });
        let url = self.endpoint(&format!("planner/plans/{plan_id}/details"))?;
        Ok(with_etag(self.write(Method::PATCH, url, Some(&body), Some(etag)).await?))
    }

    async fn create_group(&self, owner_id: &str, name: &str) -> Result<WriteOutcome<String>> {
        let owner = self.endpoint(&format!("users/{owner_id}"))?.to_string();
        let body = json!({
            "displayName": name,
            "mailNickname": mail_nickname(name),
            "description": name,
            "groupTypes": ["Unified"],
            "mailEnabled": true,
            "securityEnabled": false,
            "owners@odata.bind": [owner],
            "members@odata.bind": [owner],
        });
        let outcome = self.write(Method::POST, self.endpoint("groups")?, Some(&body), None).await?;
        let created: WriteOutcome<Created> = decode_created(outcome)?;
        Ok(created.map(|group| group.id))
    }

    async fn create_plan(&self, group_id: &str, title: &str) -> Result<WriteOutcome<RemotePlan>> {
        let body = json!({ "owner": group_id, "title": title });
        let outcome = self
            .write(Method::POST, self.endpoint("planner/plans")?, Some(&body), None)
            .await?;
        decode_created(outcome)
    }

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<Person>> {
        let users: Vec<RemoteUser> = self
            .get_all(self.endpoint(&format!("groups/{group_id}/members"))?)
            .await?;
        Ok(users.into_iter().map(Person::from).collect())
    }

    async fn get_group_owners(&self, group_id: &str) -> Result<Vec<Person>> {
        let users: Vec<RemoteUser> = self
            .get_all(self.endpoint(&format!("groups/{group_id}/owners"))?)
            .await?;
        Ok(users.into_iter().map(Person::from).collect())
    }

    async fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<WriteOutcome<()>> {
        let body = json!({ "@odata.id": self.person_bind(user_id)? });
        let url = self.endpoint(&format!("groups/{group_id}/members/$ref"))?;
        Ok(self.write(Method::POST, url, Some(&body), None).await?.map(|_| ()))
    }

    async fn list_buckets(&self, plan_id: &str) -> Result<Vec<RemoteBucket>> {
        self.get_all(self.endpoint(&format!("planner/plans/{plan_id}/buckets"))?)
            .await
    }

    async fn get_bucket(&self, bucket_id: &str) -> Result<Option<RemoteBucket>> {
        self.get_one(self.endpoint(&format!("planner/buckets/{bucket_id}"))?)
            .await
    }

    async fn create_bucket(&self, plan_id: &str, name: &str) -> Result<WriteOutcome<RemoteBucket>> {
        let body = json!({ "name": name, "planId": plan_id, "orderHint": FIRST_ORDER_HINT });
        let outcome = self
            .write(Method::POST, self.endpoint("planner/buckets")?, Some(&body), None)
            .await?;
        decode_created(outcome)
    }

    async fn update_bucket(
        &self,
        bucket_id: &str,
        name: &str,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let body = json!({ "name": name });
        let url = self.endpoint(&format!("planner/buckets/{bucket_id}"))?;
        Ok(with_etag(self.write(Method::PATCH, url, Some(&body), Some(etag)).await?))
    }

    async fn delete_bucket(&self, bucket_id: &str, etag: &str) -> Result<WriteOutcome<()>> {
        let url = self.endpoint(&format!("planner/buckets/{bucket_id}"))?;
        Ok(self.write(Method::DELETE, url, None, Some(etag)).await?.map(|_| ()))
    }

    async fn list_plan_tasks(&self, plan_id: &str) -> Result<Vec<RemoteTask>> {
        self.get_all(self.endpoint(&format!("planner/plans/{plan_id}/tasks"))?)
            .await
    }

    async fn list_bucket_tasks(&self, bucket_id: &str) -> Result<Vec<RemoteTask>> {
        self.get_all(self.endpoint(&format!("planner/buckets/{bucket_id}/tasks"))?)
            .await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<RemoteTask>> {
        self.get_one(self.endpoint(&format!("planner/tasks/{task_id}"))?).await
    }

    async fn get_task_details(&self, task_id: &str) -> Result<Option<RemoteTaskDetails>> {
        self.get_one(self.endpoint(&format!("planner/tasks/{task_id}/details"))?)
            .await
    }

    async fn create_task(&self, task: &TaskCreate) -> Result<WriteOutcome<RemoteTask>> {
        let body = create_body(task);
        let outcome = self
            .write(Method::POST, self.endpoint("planner/tasks")?, Some(&body), None)
            .await?;
        decode_created(outcome)
    }

    async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let body = patch_body(patch);
        let url = self.endpoint(&format!("planner/tasks/{task_id}"))?;
        Ok(with_etag(self.write(Method::PATCH, url, Some(&body), Some(etag)).await?))
    }

    async fn update_task_details(
        &self,
        task_id: &str,
        description: &str,
        etag: &str,
    ) -> Result<WriteOutcome<Option<String>>> {
        let body = json!({ "description": description, "previewType": "description" });
        let url = self.endpoint(&format!("planner/tasks/{task_id}/details"))?;
        Ok(with_etag(self.write(Method::PATCH, url, Some(&body), Some(etag)).await?))
    }

    async fn delete_task(&self, task_id: &str, etag: &str) -> Result<WriteOutcome<()>> {
        let url = self.endpoint(&format!("planner/tasks/{task_id}"))?;
        Ok(self.write(Method::DELETE, url, None, Some(etag)).await?.map(|_| ()))
    }

    async fn get_task_board_format(&self, task_id: &str) -> Result<Option<TaskBoardFormat>> {
        self.get_one(self.endpoint(&format!("planner/tasks/{task_id}/bucketTaskBoardFormat"))?)
            .await
    }

    async fn update_task_board_format(
        &self,
        task_id: &str,
        order_hint: &str,
        etag: &str,
    ) -> Result<WriteOutcome<()>> {
        let body = json!({ "orderHint": order_hint });
        let url = self.endpoint(&format!("planner/tasks/{task_id}/bucketTaskBoardFormat"))?;
        Ok(self.write(Method::PATCH, url, Some(&body), Some(etag)).await?.map(|_| ()))
    }

    async fn subscribe_delta(&self) -> Result<Option<DeltaCursor>> {
        let mut url = self.delta_url.clone();
        loop {
            let page: Page<Value> = self.get_page(url).await?;
            if let Some(link) = page.delta_link {
                return Ok(Some(DeltaCursor::new(link)));
            }
            match page.next_link {
                Some(link) => url = Url::parse(&link)?,
                None => {
                    log::warn!("Delta subscription ended without a delta link");
                    return Ok(None);
                }
            }
        }
    }

    async fn fetch_delta(&self, cursor: &DeltaCursor) -> Result<DeltaFetch> {
        let mut records = Vec::new();
        let mut url = Url::parse(&cursor.token)?;
        loop {
            let page: Page<Value> = match self.get_page(url).await {
                Ok(page) => page,
                Err(Error::Api { status, .. }) if is_cursor_rejected(status) => {
                    return Ok(DeltaFetch::Expired);
                }
                Err(e) => return Err(e),
            };
            records.extend(page.value);
            if let Some(link) = page.delta_link {
                return Ok(DeltaFetch::Page {
                    records,
                    cursor: DeltaCursor::new(link),
                });
            }
            match page.next_link {
                Some(link) => url = Url::parse(&link)?,
                None => return Err(Error::Other("delta page without next or delta link".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_patch_body_only_sends_changes() {
        let mut patch = TaskPatch {
            title: Some("New".into()),
            ..Default::default()
        };
        patch.remove_assignees.insert("u1".into());
        patch.add_assignees.insert("u2".into());
        patch.due_date = Some(None);

        let body = patch_body(&patch);
        assert_eq!(body["title"], "New");
        assert!(body["assignments"]["u1"].is_null());
        assert_eq!(body["assignments"]["u2"]["orderHint"], FIRST_ORDER_HINT);
        assert!(body.get("dueDateTime").is_some_and(Value::is_null));
        assert!(body.get("percentComplete").is_none());
    }

    #[test]
    fn test_empty_patch_is_empty_object() {
        assert_eq!(patch_body(&TaskPatch::default()), json!({}));
    }

    #[test]
    fn test_create_body() {
        let task = TaskCreate {
            plan_id: "p1".into(),
            bucket_id: "k1".into(),
            title: "Draft".into(),
            assignees: BTreeSet::from(["u1".to_string()]),
            due_date: None,
            percent_complete: Some(100),
        };
        let body = create_body(&task);
        assert_eq!(body["planId"], "p1");
        assert!(body["assignments"]["u1"].is_object());
        assert!(body.get("dueDateTime").is_none());
        assert_eq!(body["percentComplete"], 100);
    }

    #[test]
    fn test_mail_nickname() {
        assert!(mail_nickname("Team: Q3 plan!").starts_with("TeamQ3plan"));
        assert!(mail_nickname("???").starts_with("plan"));
    }

    #[test]
    fn test_cursor_rejection_statuses() {
        assert!(is_cursor_rejected(410));
        assert!(is_cursor_rejected(400));
        assert!(!is_cursor_rejected(503));
    }

    #[test]
    fn test_client_normalizes_base() {
        let config = GraphConfig {
            graph_url: "https://graph.example.test/v1.0".into(),
            ..Default::default()
        };
        let client = GraphClient::new("token", &config).unwrap();
        assert_eq!(
            client.endpoint("planner/tasks/t1").unwrap().as_str(),
            "https://graph.example.test/v1.0/planner/tasks/t1"
        );
    }
}
