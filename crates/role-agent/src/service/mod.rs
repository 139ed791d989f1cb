use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod client;
pub mod sse;

pub use client::PlatformClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Status { status: 404, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    All,
    LocalFile,
    RemoteUrl,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImageUpload {
    pub enabled: bool,
    pub number_limits: Option<u32>,
    pub detail: Option<Resolution>,
    pub transfer_methods: Option<Vec<TransferMethod>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileUpload {
    pub image: Option<ImageUpload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemParameters {
    #[serde(deserialize_with = "de_loose_u64")]
    pub image_file_size_limit: Option<u64>,
}

// Some platform versions send this limit as a string ("10"), others as a number.
fn de_loose_u64<'de, D>(de: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    Ok(match v {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppParams {
    pub user_input_form: Vec<Value>,
    pub file_upload: Option<FileUpload>,
    pub system_parameters: Option<SystemParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisionFile {
    #[serde(rename = "type")]
    pub file_type: String,
    pub transfer_method: TransferMethod,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub upload_file_id: String,
}

impl VisionFile {
    pub fn remote_image(url: impl Into<String>) -> Self {
        Self {
            file_type: "image".into(),
            transfer_method: TransferMethod::RemoteUrl,
            url: url.into(),
            upload_file_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionRequest {
    pub inputs: BTreeMap<String, String>,
    pub files: Vec<VisionFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub text: String,
    pub message_id: Option<String>,
    // Server-side task id, needed to stop a running generation.
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionProgress {
    Started { task_id: String },
    Chunk(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Like,
    Dislike,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Like => "like",
            Rating::Dislike => "dislike",
        }
    }
}

pub trait CompletionService: Send + Sync {
    fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &AtomicBool,
        on_progress: &mut dyn FnMut(CompletionProgress),
    ) -> Result<CompletionOutcome, ServiceError>;

    fn stop(&self, task_id: &str) -> Result<(), ServiceError>;

    fn feedback(&self, message_id: &str, rating: Option<Rating>) -> Result<(), ServiceError>;
}

pub trait ParamsSource {
    fn fetch_params(&self) -> Result<AppParams, ServiceError>;
}
