use thiserror::Error;

use crate::config::{AppInfo, Config};
use crate::prompt::{PromptConfig, user_inputs_form_to_prompt_variables};
use crate::service::{AppParams, ParamsSource, Resolution, ServiceError, TransferMethod};

/// Why the application cannot be used. Every variant leaves the UI up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unavailable {
    #[error("Please set APP_ID and API_KEY")]
    ConfigMissing,
    #[error("App is unavailable")]
    NotFound,
    #[error("App is unavailable: {0}")]
    Unknown(String),
}

impl Unavailable {
    pub fn is_unknown_reason(&self) -> bool {
        matches!(self, Unavailable::Unknown(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionSettings {
    pub enabled: bool,
    pub number_limits: u32,
    pub detail: Resolution,
    pub transfer_methods: Vec<TransferMethod>,
    pub image_file_size_limit: u64,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            number_limits: 2,
            detail: Resolution::Low,
            transfer_methods: vec![TransferMethod::LocalFile],
            image_file_size_limit: 0,
        }
    }
}

impl VisionSettings {
    pub fn from_params(params: &AppParams) -> Self {
        let mut out = VisionSettings::default();
        if let Some(image) = params.file_upload.as_ref().and_then(|f| f.image.as_ref()) {
            out.enabled = image.enabled;
            if let Some(n) = image.number_limits {
                out.number_limits = n;
            }
            if let Some(d) = image.detail {
                out.detail = d;
            }
            if let Some(m) = image.transfer_methods.as_ref().filter(|m| !m.is_empty()) {
                out.transfer_methods = m.clone();
            }
        }
        if let Some(limit) = params
            .system_parameters
            .as_ref()
            .and_then(|s| s.image_file_size_limit)
        {
            out.image_file_size_limit = limit;
        }
        out
    }

    pub fn accepts_remote_url(&self) -> bool {
        self.transfer_methods
            .iter()
            .any(|m| matches!(m, TransferMethod::RemoteUrl | TransferMethod::All))
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub info: AppInfo,
    pub prompt_config: PromptConfig,
    pub vision: VisionSettings,
    pub is_workflow: bool,
}

pub fn bootstrap(cfg: &Config, source: &dyn ParamsSource) -> Result<AppState, Unavailable> {
    if !cfg.has_app_credentials() {
        tracing::warn!("app id or api key is not configured");
        return Err(Unavailable::ConfigMissing);
    }

    let params = source.fetch_params().map_err(|e| classify(&e))?;
    let vars = user_inputs_form_to_prompt_variables(&params.user_input_form);
    let vision = VisionSettings::from_params(&params);
    tracing::info!(
        variables = vars.len(),
        vision = vision.enabled,
        "application parameters loaded"
    );

    Ok(AppState {
        info: cfg.app.clone(),
        prompt_config: PromptConfig::from_variables(vars),
        vision,
        is_workflow: cfg.generation.is_workflow,
    })
}

fn classify(e: &ServiceError) -> Unavailable {
    if e.is_not_found() {
        tracing::warn!("application not found: {e}");
        Unavailable::NotFound
    } else {
        tracing::error!("failed to load application parameters: {e}");
        Unavailable::Unknown(e.to_string())
    }
}
