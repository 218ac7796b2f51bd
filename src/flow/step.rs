use serde::{Deserialize, Serialize};
use serde_json as json;

pub const DEFAULT_WAIT_MS: u64 = 1000;

fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_MS
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Flow {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// The closed set of step kinds a flow can contain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    #[serde(rename = "goto", alias = "navigate")]
    Navigate { url: String },
    Click { selector: String },
    Hover { selector: String },
    Type { selector: String, value: String },
    #[serde(rename = "press", alias = "pressKey")]
    PressKey {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },
    #[serde(rename = "waitFor", alias = "waitForSelector")]
    WaitForSelector { selector: String },
    #[serde(rename = "wait", alias = "waitFixed")]
    WaitFixed {
        #[serde(default = "default_wait_ms")]
        ms: u64,
    },
    AssertVisible { selector: String },
    AssertText { selector: String, value: String },
    AssertUrl { url: String },
    #[serde(rename = "assertNoErrors", alias = "assertNoConsoleErrors")]
    AssertNoConsoleErrors,
    Screenshot {
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(alias = "supabaseAuth")]
    IdentityAuth {
        email: String,
        password: String,
        #[serde(default)]
        metadata: json::Map<String, json::Value>,
    },
    #[serde(alias = "supabaseSignOut")]
    IdentitySignOut,
}

/// One configured step. Unknown kinds are kept so that they fail when the
/// flow reaches them instead of when the config is loaded.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "json::Value")]
pub enum Step {
    Action(Action),
    Unknown(String),
}

impl TryFrom<json::Value> for Step {
    type Error = String;

    fn try_from(value: json::Value) -> Result<Self, Self::Error> {
        let name = value
            .get("action")
            .and_then(json::Value::as_str)
            .ok_or_else(|| "flow step is missing \"action\"".to_string())?
            .to_string();
        match json::from_value(value) {
            Ok(action) => Ok(Step::Action(action)),
            Err(err) if err.to_string().starts_with("unknown variant") => {
                Ok(Step::Unknown(name))
            }
            Err(err) => Err(format!("invalid \"{}\" step: {}", name, err)),
        }
    }
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "goto",
            Action::Click { .. } => "click",
            Action::Hover { .. } => "hover",
            Action::Type { .. } => "type",
            Action::PressKey { .. } => "press",
            Action::WaitForSelector { .. } => "waitFor",
            Action::WaitFixed { .. } => "wait",
            Action::AssertVisible { .. } => "assertVisible",
            Action::AssertText { .. } => "assertText",
            Action::AssertUrl { .. } => "assertUrl",
            Action::AssertNoConsoleErrors => "assertNoErrors",
            Action::Screenshot { .. } => "screenshot",
            Action::IdentityAuth { .. } => "identityAuth",
            Action::IdentitySignOut => "identitySignOut",
        }
    }

    pub fn label(&self) -> String {
        match self {
            Action::Navigate { url } => format!("goto {}", url),
            Action::Click { selector } => format!("click {}", selector),
            Action::Hover { selector } => format!("hover {}", selector),
            Action::Type { selector, value } => {
                format!("type \"{}\" into {}", value, selector)
            }
            Action::PressKey { key, .. } => format!("press {}", key),
            Action::WaitForSelector { selector } => {
                format!("waitFor {}", selector)
            }
            Action::WaitFixed { ms } => format!("wait {}ms", ms),
            Action::AssertVisible { selector } => {
                format!("assertVisible {}", selector)
            }
            Action::AssertText { value, .. } => {
                format!("assertText \"{}\"", value)
            }
            Action::AssertUrl { url } => format!("assertUrl {}", url),
            Action::AssertNoConsoleErrors => "assertNoErrors".to_string(),
            Action::Screenshot { name } => {
                format!("screenshot {}", name.as_deref().unwrap_or_default())
                    .trim_end()
                    .to_string()
            }
            Action::IdentityAuth { email, .. } => {
                format!("identityAuth {}", email)
            }
            Action::IdentitySignOut => "identitySignOut".to_string(),
        }
    }
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Action(action) => action.name(),
            Step::Unknown(name) => name,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Step::Action(action) => action.label(),
            Step::Unknown(name) => name.clone(),
        }
    }
}
