use std::collections::BTreeMap;

use thiserror::Error;

use crate::app::VisionSettings;
use crate::prompt::PromptVariable;
use crate::service::{CompletionRequest, VisionFile};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("Variable value can not be empty")]
    ValueRequired { var: String },
    #[error("Image input is not enabled for this app")]
    VisionDisabled,
    #[error("At most {limit} images can be attached")]
    TooManyFiles { limit: u32 },
    #[error("Image URL must start with http:// or https://")]
    InvalidUrl,
}

/// Values for a single run, keyed by variable key.
#[derive(Debug, Clone)]
pub struct InputForm {
    vars: Vec<PromptVariable>,
    inputs: BTreeMap<String, String>,
    vision: VisionSettings,
    files: Vec<VisionFile>,
}

impl InputForm {
    pub fn new(vars: Vec<PromptVariable>, vision: VisionSettings) -> Self {
        let inputs = vars
            .iter()
            .filter_map(|v| v.default.clone().map(|d| (v.key.clone(), d)))
            .collect();
        Self {
            vars,
            inputs,
            vision,
            files: Vec::new(),
        }
    }

    pub fn vars(&self) -> &[PromptVariable] {
        &self.vars
    }

    pub fn value(&self, key: &str) -> &str {
        self.inputs.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inputs.insert(key.to_string(), value.into());
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
        self.files.clear();
    }

    pub fn files(&self) -> &[VisionFile] {
        &self.files
    }

    pub fn vision(&self) -> &VisionSettings {
        &self.vision
    }

    /// Every variable that is required, or is missing its key or name, must
    /// have a non-empty value.
    pub fn check_can_send(&self) -> Result<(), FormError> {
        for v in &self.vars {
            let must_fill = v.key.trim().is_empty() || v.name.trim().is_empty() || v.is_required();
            if must_fill && self.value(&v.key).is_empty() {
                return Err(FormError::ValueRequired { var: v.name.clone() });
            }
        }
        Ok(())
    }

    pub fn submit(&self) -> Result<CompletionRequest, FormError> {
        self.check_can_send()?;
        let inputs = self
            .vars
            .iter()
            .map(|v| (v.key.clone(), self.value(&v.key).to_string()))
            .collect();
        Ok(CompletionRequest {
            inputs,
            files: if self.vision.enabled {
                self.files.clone()
            } else {
                Vec::new()
            },
        })
    }

    /// Writes quick-prompt text into the first variable and submits in one
    /// step. Empty text, or a form without variables, drops the event.
    pub fn apply_quick_prompt(&mut self, text: &str) -> Option<Result<CompletionRequest, FormError>> {
        if text.is_empty() {
            return None;
        }
        let first = self.vars.first()?.key.clone();
        self.set(&first, text);
        Some(self.submit())
    }

    pub fn add_image_url(&mut self, url: &str) -> Result<(), FormError> {
        if !self.vision.enabled {
            return Err(FormError::VisionDisabled);
        }
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FormError::InvalidUrl);
        }
        let limit = self.vision.number_limits;
        if self.files.len() >= limit as usize {
            return Err(FormError::TooManyFiles { limit });
        }
        self.files.push(VisionFile::remote_image(url));
        Ok(())
    }

    pub fn remove_image(&mut self, index: usize) -> Option<VisionFile> {
        (index < self.files.len()).then(|| self.files.remove(index))
    }
}
