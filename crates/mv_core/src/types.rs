use crate::app_error::{AppError, AppResult};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const GLOBAL_SCOPE: &str = "global";
const PROJECT_SCOPE_PREFIX: &str = "project:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Project(String),
}

impl Scope {
    pub fn parse(text: &str) -> Option<Scope> {
        if text == GLOBAL_SCOPE {
            return Some(Scope::Global);
        }
        let name = text.strip_prefix(PROJECT_SCOPE_PREFIX)?;
        if name.is_empty() {
            return None;
        }
        Some(Scope::Project(name.to_string()))
    }

    pub fn from_text(text: &str) -> AppResult<Scope> {
        Scope::parse(text).ok_or_else(|| {
            AppError::new(
                "MV_SCOPE_INVALID",
                "types",
                "scope must be 'global' or 'project:<name>'",
                false,
                serde_json::json!({ "scope": text }),
            )
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str(GLOBAL_SCOPE),
            Scope::Project(name) => write!(f, "{}{}", PROJECT_SCOPE_PREFIX, name),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Scope::parse(&text)
            .ok_or_else(|| D::Error::custom(format!("invalid scope string: {text}")))
    }
}
