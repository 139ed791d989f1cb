use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, Response};
use serde_json::{Value, json};

use super::sse::{PlatformEvent, SseReader, decode_platform_event};
use super::{
    AppParams, CompletionOutcome, CompletionProgress, CompletionRequest, CompletionService,
    ParamsSource, Rating, ServiceError,
};
use crate::config::Config;

/// Blocking client for the application platform's service API.
#[derive(Clone)]
pub struct PlatformClient {
    http: Client,
    base: String,
    api_key: String,
    user: String,
    workflow: bool,
}

impl PlatformClient {
    pub fn new(cfg: &Config) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.api.timeout_secs.max(1)))
            .build()
            .map_err(|e| ServiceError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: cfg.api.api_url.trim_end_matches('/').to_string(),
            api_key: cfg.api.api_key.clone(),
            user: cfg.api.user.clone(),
            workflow: cfg.generation.is_workflow,
        })
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow
    }

    fn url(&self, path: &str) -> Result<Url, ServiceError> {
        Url::parse(&format!("{}/{}", self.base, path.trim_start_matches('/')))
            .map_err(|e| ServiceError::Transport(format!("invalid API url: {e}")))
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Response, ServiceError> {
        let url = self.url(path)?;
        tracing::debug!(%url, "POST");
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        check_status(res)
    }
}

// Non-2xx responses carry `{code, message, status}`; surface the message when present.
fn check_status(res: Response) -> Result<Response, ServiceError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        });
    Err(ServiceError::Status {
        status: status.as_u16(),
        message,
    })
}

fn outputs_to_text(outputs: &Value) -> String {
    match outputs {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(map) if map.len() == 1 => match map.values().next() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

impl ParamsSource for PlatformClient {
    fn fetch_params(&self) -> Result<AppParams, ServiceError> {
        let mut url = self.url("parameters")?;
        url.query_pairs_mut().append_pair("user", &self.user);
        tracing::debug!(%url, "GET");
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let res = check_status(res)?;
        res.json::<AppParams>()
            .map_err(|e| ServiceError::Decode(format!("parameters: {e}")))
    }
}

impl CompletionService for PlatformClient {
    fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &AtomicBool,
        on_progress: &mut dyn FnMut(CompletionProgress),
    ) -> Result<CompletionOutcome, ServiceError> {
        let path = if self.workflow {
            "workflows/run"
        } else {
            "completion-messages"
        };
        let mut body = json!({
            "inputs": req.inputs,
            "response_mode": "streaming",
            "user": self.user,
        });
        if !req.files.is_empty() {
            body["files"] = serde_json::to_value(&req.files)
                .map_err(|e| ServiceError::Decode(format!("files: {e}")))?;
        }
        let res = self.post_json(path, &body)?;

        let mut reader = SseReader::new(BufReader::new(res));
        let mut outcome = CompletionOutcome::default();
        let mut ended = false;

        while let Some(ev) = reader.next_event()? {
            if cancel.load(Ordering::Relaxed) {
                return Err(ServiceError::Cancelled);
            }
            if ev.data.trim().is_empty() {
                continue;
            }
            match decode_platform_event(&ev.data)? {
                PlatformEvent::Message {
                    answer,
                    message_id,
                    task_id,
                } => {
                    if outcome.task_id.is_none() {
                        if let Some(t) = task_id {
                            on_progress(CompletionProgress::Started { task_id: t.clone() });
                            outcome.task_id = Some(t);
                        }
                    }
                    if outcome.message_id.is_none() {
                        outcome.message_id = message_id;
                    }
                    if !answer.is_empty() {
                        outcome.text.push_str(&answer);
                        on_progress(CompletionProgress::Chunk(answer));
                    }
                }
                PlatformEvent::MessageEnd { message_id } => {
                    if message_id.is_some() {
                        outcome.message_id = message_id;
                    }
                    ended = true;
                    break;
                }
                PlatformEvent::WorkflowStarted { task_id } => {
                    if let Some(t) = task_id {
                        on_progress(CompletionProgress::Started { task_id: t.clone() });
                        outcome.task_id = Some(t);
                    }
                }
                PlatformEvent::TextChunk { text } => {
                    if !text.is_empty() {
                        outcome.text.push_str(&text);
                        on_progress(CompletionProgress::Chunk(text));
                    }
                }
                PlatformEvent::WorkflowFinished {
                    status,
                    outputs,
                    error,
                } => {
                    if status != "succeeded" {
                        return Err(ServiceError::Stream(
                            error.unwrap_or_else(|| format!("workflow {status}")),
                        ));
                    }
                    if outcome.text.is_empty() {
                        let text = outputs_to_text(&outputs);
                        if !text.is_empty() {
                            on_progress(CompletionProgress::Chunk(text.clone()));
                        }
                        outcome.text = text;
                    }
                    ended = true;
                    break;
                }
                PlatformEvent::Error { message, status } => {
                    return Err(match status {
                        Some(status) => ServiceError::Status { status, message },
                        None => ServiceError::Stream(message),
                    });
                }
                PlatformEvent::Ping | PlatformEvent::Other(_) => {}
            }
        }

        if cancel.load(Ordering::Relaxed) {
            return Err(ServiceError::Cancelled);
        }
        if !ended && outcome.text.is_empty() {
            return Err(ServiceError::Stream(
                "stream ended before any completion was produced".into(),
            ));
        }
        Ok(outcome)
    }

    fn stop(&self, task_id: &str) -> Result<(), ServiceError> {
        let path = if self.workflow {
            format!("workflows/tasks/{task_id}/stop")
        } else {
            format!("completion-messages/{task_id}/stop")
        };
        self.post_json(&path, &json!({ "user": self.user }))?;
        Ok(())
    }

    fn feedback(&self, message_id: &str, rating: Option<Rating>) -> Result<(), ServiceError> {
        let body = json!({
            "rating": rating.map(|r| r.as_str()),
            "user": self.user,
        });
        self.post_json(&format!("messages/{message_id}/feedbacks"), &body)?;
        Ok(())
    }
}
