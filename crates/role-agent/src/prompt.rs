use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Paragraph,
    Number,
    Select,
}

impl VarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VarType::String => "string",
            VarType::Paragraph => "paragraph",
            VarType::Number => "number",
            VarType::Select => "select",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptVariable {
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub required: Option<bool>,
    pub max_length: Option<usize>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

impl PromptVariable {
    pub fn new(key: impl Into<String>, name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            var_type,
            required: None,
            max_length: None,
            options: Vec::new(),
            default: None,
        }
    }

    // Only an explicit `false` makes a variable optional.
    pub fn is_required(&self) -> bool {
        self.required != Some(false)
    }

    pub fn is_string(&self) -> bool {
        self.var_type == VarType::String
    }

    // An unset or zero limit falls back to the configured default.
    pub fn max_len(&self, default: usize) -> usize {
        self.max_length.filter(|n| *n > 0).unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptConfig {
    pub prompt_template: String,
    pub prompt_variables: Vec<PromptVariable>,
}

impl PromptConfig {
    pub fn from_variables(prompt_variables: Vec<PromptVariable>) -> Self {
        Self {
            prompt_template: String::new(),
            prompt_variables,
        }
    }

    pub fn first_key(&self) -> Option<&str> {
        self.prompt_variables.first().map(|v| v.key.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FormItemContent {
    label: String,
    variable: String,
    required: Option<bool>,
    max_length: Option<usize>,
    options: Vec<String>,
    default: Option<Value>,
}

fn default_as_string(v: Option<Value>) -> Option<String> {
    match v? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Converts the platform's `user_input_form` into prompt variables.
///
/// Each form item is an object with a single key naming the control kind
/// (`text-input`, `paragraph`, `number` or `select`). Unknown kinds are skipped.
pub fn user_inputs_form_to_prompt_variables(form: &[Value]) -> Vec<PromptVariable> {
    let mut out = Vec::new();
    for item in form {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let (var_type, content) = if let Some(c) = obj.get("paragraph") {
            (VarType::Paragraph, c)
        } else if let Some(c) = obj.get("text-input") {
            (VarType::String, c)
        } else if let Some(c) = obj.get("number") {
            (VarType::Number, c)
        } else if let Some(c) = obj.get("select") {
            (VarType::Select, c)
        } else {
            tracing::debug!(
                kinds = ?obj.keys().collect::<Vec<_>>(),
                "skipping unsupported input form item"
            );
            continue;
        };

        let content: FormItemContent = match serde_json::from_value(content.clone()) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("skipping malformed input form item: {e}");
                continue;
            }
        };

        let options = if var_type == VarType::Select {
            content.options
        } else {
            Vec::new()
        };
        out.push(PromptVariable {
            key: content.variable,
            name: content.label,
            var_type,
            required: content.required,
            max_length: match var_type {
                VarType::String | VarType::Paragraph => content.max_length,
                _ => None,
            },
            options,
            default: default_as_string(content.default),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_each_control_kind() {
        let form = vec![
            json!({"text-input": {"label": "Query", "variable": "query", "required": true, "max_length": 200}}),
            json!({"paragraph": {"label": "Context", "variable": "context", "required": false}}),
            json!({"number": {"label": "Count", "variable": "count"}}),
            json!({"select": {"label": "Role", "variable": "role", "options": ["CL", "PO"]}}),
        ];
        let vars = user_inputs_form_to_prompt_variables(&form);
        assert_eq!(vars.len(), 4);

        assert_eq!(vars[0].key, "query");
        assert_eq!(vars[0].name, "Query");
        assert_eq!(vars[0].var_type, VarType::String);
        assert_eq!(vars[0].max_length, Some(200));
        assert!(vars[0].is_required());

        assert_eq!(vars[1].var_type, VarType::Paragraph);
        assert!(!vars[1].is_required());

        assert_eq!(vars[2].var_type, VarType::Number);
        assert!(vars[2].is_required(), "absent required flag means required");

        assert_eq!(vars[3].var_type, VarType::Select);
        assert_eq!(vars[3].options, vec!["CL".to_string(), "PO".to_string()]);
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let form = vec![
            json!({"file": {"label": "Doc", "variable": "doc"}}),
            json!({"text-input": {"label": "Query", "variable": "query"}}),
        ];
        let vars = user_inputs_form_to_prompt_variables(&form);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].key, "query");
    }

    #[test]
    fn max_len_falls_back_on_zero_or_unset() {
        let mut v = PromptVariable::new("q", "Query", VarType::String);
        assert_eq!(v.max_len(48), 48);
        v.max_length = Some(0);
        assert_eq!(v.max_len(48), 48);
        v.max_length = Some(5);
        assert_eq!(v.max_len(48), 5);
    }
}
