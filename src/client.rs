//! HTTP access to the corpus server.
//!
//! Every server action lives under the page's `rootUrl`. Responses are JSON
//! objects carrying an optional `messages` list of `[level, text]` pairs
//! next to the action-specific payload; an `error` message turns the whole
//! call into [`ClientError::Server`].
//!
//! Models do not talk to [`ServerClient`] directly. They depend on the
//! narrow [`TaskApi`] and [`WordlistApi`] traits so tests can substitute
//! in-memory fakes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::conf::PageConf;
use crate::error::ClientError;
use crate::task::AsyncTaskInfo;

/// Boxed future returned by the dyn-compatible API traits.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Request arguments as ordered key/value pairs. Keys may repeat.
pub type Args<'a> = [(&'a str, String)];

/// Server action returning the status of the user's background tasks.
pub const CHECK_TASKS_STATUS_PATH: &str = "check_tasks_status";
/// Server action forgetting finished tasks.
pub const REMOVE_TASK_INFO_PATH: &str = "remove_task_info";
/// Server action starting a word-list build.
pub const WORDLIST_SUBMIT_PATH: &str = "wordlist/submit";

/// Background task operations used by the task checker and its watchers.
pub trait TaskApi: Send + Sync {
    /// Latest status of every task the server tracks for the user.
    fn check_tasks_status(&self) -> ApiFuture<'_, Vec<AsyncTaskInfo>>;

    /// Ask the server to forget the given finished tasks.
    ///
    /// # Returns
    ///
    /// The tasks the server still tracks afterwards.
    fn remove_task_info(&self, idents: Vec<String>) -> ApiFuture<'_, Vec<AsyncTaskInfo>>;
}

/// Word-list form submission arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordlistArgs {
    pub corpname: String,
    pub wlattr: String,
    pub wlpat: String,
    pub wlminfreq: u32,
}

impl WordlistArgs {
    fn to_args(&self) -> Vec<(&'static str, String)> {
        vec![
            ("corpname", self.corpname.clone()),
            ("wlattr", self.wlattr.clone()),
            ("wlpat", self.wlpat.clone()),
            ("wlminfreq", self.wlminfreq.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WordlistSubmitResponse {
    /// Present when the server builds the list asynchronously.
    #[serde(default)]
    pub task: Option<AsyncTaskInfo>,
}

/// Word-list submission used by the word-list form model.
pub trait WordlistApi: Send + Sync {
    fn submit_wordlist(&self, args: WordlistArgs) -> ApiFuture<'_, WordlistSubmitResponse>;
}

#[derive(Debug, Deserialize)]
struct TaskListResponse {
    #[serde(default)]
    data: Vec<AsyncTaskInfo>,
}

/// Client for the server's JSON action endpoints.
///
/// `Clone` is cheap: the underlying connection pool is shared.
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    root_url: Url,
    /// Shared, refreshable Bearer token. Empty means "no auth".
    auth_token: Option<Arc<RwLock<String>>>,
}

impl fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerClient")
            .field("root_url", &self.root_url.as_str())
            .field("auth", &self.auth_token.is_some())
            .finish()
    }
}

impl ServerClient {
    /// Create a client rooted at `root_url`.
    ///
    /// A missing trailing `/` is added so that action paths nest under the
    /// root instead of replacing its last segment.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Url`] if `root_url` is not an absolute URL.
    pub fn new(root_url: &str) -> Result<Self, ClientError> {
        let mut root_url = Url::parse(root_url)?;
        if !root_url.path().ends_with('/') {
            let path = format!("{}/", root_url.path());
            root_url.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            root_url,
            auth_token: None,
        })
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Url`] if the configured `rootUrl` is invalid.
    pub fn from_conf(conf: &PageConf) -> Result<Self, ClientError> {
        Self::new(&conf.root_url)
    }

    /// Send `Authorization: Bearer <token>` with every request.
    ///
    /// The lock is read on each request, so writing a new value rotates
    /// credentials without rebuilding the client.
    pub fn with_auth_token(mut self, token: Arc<RwLock<String>>) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn root_url(&self) -> &Url {
        &self.root_url
    }

    /// Build the URL of a server action.
    ///
    /// # Arguments
    ///
    /// * `path` - Action path relative to the root (e.g. `"wordlist/submit"`).
    /// * `args` - Query arguments, appended in order.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Url`] if `path` cannot be joined to the root.
    pub fn create_action_url(&self, path: &str, args: &Args<'_>) -> Result<Url, ClientError> {
        let mut url = self.root_url.join(path.trim_start_matches('/'))?;
        if !args.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in args {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn bearer_token(&self) -> Option<String> {
        let token = self.auth_token.as_ref()?;
        let token = token.read().unwrap_or_else(|e| e.into_inner());
        if token.is_empty() {
            None
        } else {
            Some(token.clone())
        }
    }

    /// Call a server action and decode its payload.
    ///
    /// `GET` and `DELETE` send `args` as the query string; other methods
    /// send them as a form-encoded body.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Http`] on transport failure.
    /// - [`ClientError::Server`] if the response carries an `error` message.
    /// - [`ClientError::Status`] on a non-success status without a message.
    /// - [`ClientError::Decode`] if the payload does not match `T`.
    pub async fn ajax<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        args: &Args<'_>,
    ) -> Result<T, ClientError> {
        let query_args = method == Method::GET || method == Method::DELETE;
        let url = if query_args {
            self.create_action_url(path, args)?
        } else {
            self.create_action_url(path, &[])?
        };

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query_args {
            request = request.form(args);
        }
        if let Some(token) = self.bearer_token() {
            request = request.bearer_auth(token);
        }

        tracing::debug!(method = %method, path, "server request");
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) if !status.is_success() => return Err(ClientError::Status(status.as_u16())),
            Err(e) => return Err(ClientError::Decode(e)),
        };
        let payload = decode_envelope(value)?;
        if !status.is_success() {
            tracing::warn!(
                method = %method,
                path,
                status = status.as_u16(),
                "server request failed"
            );
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(serde_json::from_value(payload)?)
    }
}

/// Strip `messages` from a response envelope.
///
/// Non-error messages are logged; the first `error` message fails the call.
fn decode_envelope(mut value: Value) -> Result<Value, ClientError> {
    let messages = value
        .as_object_mut()
        .and_then(|obj| obj.remove("messages"))
        .unwrap_or(Value::Null);

    let Value::Array(messages) = messages else {
        return Ok(value);
    };
    let mut errors = Vec::new();
    for message in messages {
        let (level, text) = match message {
            Value::Array(pair) if pair.len() == 2 => (
                pair[0].as_str().unwrap_or_default().to_owned(),
                pair[1].as_str().unwrap_or_default().to_owned(),
            ),
            other => {
                tracing::debug!(message = %other, "ignoring malformed server message");
                continue;
            }
        };
        if level == "error" {
            errors.push(text);
        } else {
            tracing::info!(level = %level, text = %text, "server message");
        }
    }
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(ClientError::Server(errors.join("; ")))
    }
}

impl TaskApi for ServerClient {
    fn check_tasks_status(&self) -> ApiFuture<'_, Vec<AsyncTaskInfo>> {
        Box::pin(async move {
            let response: TaskListResponse =
                self.ajax(Method::GET, CHECK_TASKS_STATUS_PATH, &[]).await?;
            Ok(response.data)
        })
    }

    fn remove_task_info(&self, idents: Vec<String>) -> ApiFuture<'_, Vec<AsyncTaskInfo>> {
        Box::pin(async move {
            let args: Vec<(&str, String)> = idents.into_iter().map(|id| ("tasks", id)).collect();
            let response: TaskListResponse = self
                .ajax(Method::DELETE, REMOVE_TASK_INFO_PATH, &args)
                .await?;
            Ok(response.data)
        })
    }
}

impl WordlistApi for ServerClient {
    fn submit_wordlist(&self, args: WordlistArgs) -> ApiFuture<'_, WordlistSubmitResponse> {
        Box::pin(async move {
            let args = args.to_args();
            let response: WordlistSubmitResponse =
                self.ajax(Method::POST, WORDLIST_SUBMIT_PATH, &args).await?;
            Ok(response)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Serve `router` on an ephemeral local port.
    ///
    /// # Returns
    ///
    /// The root URL (with trailing `/`).
    pub(crate) async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no address");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("test server failed");
        });
        format!("http://{addr}/")
    }

    /// In-memory [`TaskApi`] returning scripted responses.
    ///
    /// Each `check_tasks_status` call pops the next scripted response; once
    /// the script is exhausted the last response repeats.
    #[derive(Default)]
    pub(crate) struct FakeTaskApi {
        pub statuses: Mutex<VecDeque<Result<Vec<AsyncTaskInfo>, String>>>,
        pub last_status: Mutex<Option<Vec<AsyncTaskInfo>>>,
        pub removed: Mutex<Vec<Vec<String>>>,
        pub remaining_after_remove: Mutex<Vec<AsyncTaskInfo>>,
        pub status_calls: Mutex<usize>,
    }

    impl FakeTaskApi {
        pub(crate) fn push_status(&self, response: Result<Vec<AsyncTaskInfo>, String>) {
            self.statuses.lock().unwrap().push_back(response);
        }

        pub(crate) fn status_calls(&self) -> usize {
            *self.status_calls.lock().unwrap()
        }
    }

    impl TaskApi for FakeTaskApi {
        fn check_tasks_status(&self) -> ApiFuture<'_, Vec<AsyncTaskInfo>> {
            *self.status_calls.lock().unwrap() += 1;
            let next = self.statuses.lock().unwrap().pop_front();
            let result = match next {
                Some(Ok(tasks)) => {
                    *self.last_status.lock().unwrap() = Some(tasks.clone());
                    Ok(tasks)
                }
                Some(Err(msg)) => Err(ClientError::Server(msg)),
                None => Ok(self.last_status.lock().unwrap().clone().unwrap_or_default()),
            };
            Box::pin(async move { result })
        }

        fn remove_task_info(&self, idents: Vec<String>) -> ApiFuture<'_, Vec<AsyncTaskInfo>> {
            self.removed.lock().unwrap().push(idents);
            let remaining = self.remaining_after_remove.lock().unwrap().clone();
            Box::pin(async move { Ok::<_, ClientError>(remaining) })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::{Form, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::test_fixtures::serve;
    use super::*;
    use crate::task::AsyncTaskStatus;

    #[test]
    fn action_url_nests_under_root() {
        let client = ServerClient::new("https://kontext.example.org/app").expect("valid root");
        let url = client
            .create_action_url("wordlist/submit", &[("corpname", "syn2020".into())])
            .expect("valid url");
        assert_eq!(
            url.as_str(),
            "https://kontext.example.org/app/wordlist/submit?corpname=syn2020"
        );
    }

    #[test]
    fn action_url_keeps_repeated_args_in_order() {
        let client = ServerClient::new("http://localhost/").expect("valid root");
        let url = client
            .create_action_url(
                "/remove_task_info",
                &[("tasks", "a".into()), ("tasks", "b c".into())],
            )
            .expect("valid url");
        assert_eq!(
            url.as_str(),
            "http://localhost/remove_task_info?tasks=a&tasks=b+c"
        );
    }

    #[test]
    fn relative_root_is_rejected() {
        let err = ServerClient::new("kontext/").unwrap_err();
        assert!(matches!(err, ClientError::Url(_)));
    }

    #[test]
    fn envelope_error_message_fails() {
        let err = decode_envelope(json!({
            "messages": [["info", "hello"], ["error", "corpus not found"]],
            "data": []
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "server error: corpus not found");
    }

    #[test]
    fn envelope_without_errors_strips_messages() {
        let payload = decode_envelope(json!({
            "messages": [["warning", "slow"]],
            "data": [1]
        }))
        .expect("no error messages");
        assert_eq!(payload, json!({"data": [1]}));
    }

    #[tokio::test]
    async fn check_tasks_status_decodes_task_list() {
        let router = Router::new().route(
            "/check_tasks_status",
            get(|| async {
                Json(json!({
                    "messages": [],
                    "data": [{"ident": "t1", "status": "STARTED", "label": "wordlist"}]
                }))
            }),
        );
        let client = ServerClient::new(&serve(router).await).expect("client");
        let tasks = client.check_tasks_status().await.expect("status call");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, AsyncTaskStatus::Started);
    }

    #[tokio::test]
    async fn delete_sends_args_as_query_string() {
        let router = Router::new().route(
            "/remove_task_info",
            delete(|Query(params): Query<Vec<(String, String)>>| async move {
                let idents: Vec<String> = params.into_iter().map(|(_, v)| v).collect();
                Json(json!({
                    "data": [{"ident": "kept", "status": "PENDING"}],
                    "removed": idents
                }))
            }),
        );
        let client = ServerClient::new(&serve(router).await).expect("client");
        let remaining = client
            .remove_task_info(vec!["t1".into(), "t2".into()])
            .await
            .expect("remove call");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ident, "kept");
    }

    #[tokio::test]
    async fn post_sends_args_as_form_body() {
        let router = Router::new().route(
            "/wordlist/submit",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("wlattr").map(String::as_str), Some("lemma"));
                assert_eq!(form.get("wlminfreq").map(String::as_str), Some("5"));
                Json(json!({ "task": {"ident": "wl-1", "status": "PENDING"} }))
            }),
        );
        let client = ServerClient::new(&serve(router).await).expect("client");
        let response = client
            .submit_wordlist(WordlistArgs {
                corpname: "syn2020".into(),
                wlattr: "lemma".into(),
                wlpat: ".*".into(),
                wlminfreq: 5,
            })
            .await
            .expect("submit call");
        assert_eq!(response.task.map(|t| t.ident).as_deref(), Some("wl-1"));
    }

    #[tokio::test]
    async fn server_error_message_becomes_client_error() {
        let router = Router::new().route(
            "/check_tasks_status",
            get(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "messages": [["error", "session expired"]] })),
                )
            }),
        );
        let client = ServerClient::new(&serve(router).await).expect("client");
        let err = client.check_tasks_status().await.unwrap_err();
        match err {
            ClientError::Server(message) => assert_eq!(message, "session expired"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_failure_reports_status() {
        let router = Router::new().route(
            "/check_tasks_status",
            get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let client = ServerClient::new(&serve(router).await).expect("client");
        let err = client.check_tasks_status().await.unwrap_err();
        assert!(matches!(err, ClientError::Status(502)));
    }

    #[tokio::test]
    async fn bearer_token_is_read_per_request() {
        let router = Router::new().route(
            "/check_tasks_status",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                Json(json!({ "data": [{"ident": auth}] }))
            }),
        );
        let token = Arc::new(RwLock::new(String::new()));
        let client = ServerClient::new(&serve(router).await)
            .expect("client")
            .with_auth_token(Arc::clone(&token));

        let tasks = client.check_tasks_status().await.expect("call");
        assert_eq!(tasks[0].ident, "");

        *token.write().unwrap() = "abc".into();
        let tasks = client.check_tasks_status().await.expect("call");
        assert_eq!(tasks[0].ident, "Bearer abc");
    }
}
