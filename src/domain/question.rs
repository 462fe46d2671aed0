//! One node of a cluster type's configuration tree.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,

    #[serde(default, rename = "type")]
    pub kind: QuestionKind,

    /// Environment variable the answer is exported under. Defaults to the
    /// upper-cased id.
    #[serde(default)]
    pub env: Option<String>,

    #[serde(default)]
    pub validation: Validation,

    #[serde(default, deserialize_with = "scalar_string")]
    pub default: Option<String>,

    /// Commands whose output suggests a default, tried in order. A single
    /// string is one command.
    #[serde(default, deserialize_with = "one_or_many")]
    pub default_smart: Vec<String>,

    /// Parent answer this question is conditional on.
    #[serde(default, alias = "where", deserialize_with = "scalar_string")]
    pub on: Option<String>,

    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    #[default]
    #[serde(alias = "text", alias = "string")]
    FreeText,
    Boolean,
    Password,
    Conditional,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Question {
    pub fn env_name(&self) -> String {
        self.env
            .clone()
            .unwrap_or_else(|| self.id.to_uppercase())
    }

    /// Compiled format rule, if any.
    pub fn format(&self) -> Result<Option<Regex>> {
        Ok(match &self.validation.format {
            Some(f) => Some(Regex::new(f)?),
            None => None,
        })
    }

    /// Whether `value` satisfies the format rule. Questions without a rule
    /// accept anything.
    pub fn accepts(&self, value: &str) -> Result<bool> {
        Ok(self.format()?.map_or(true, |re| re.is_match(value)))
    }

    /// Visible under a parent whose resolved answer is `parent`. Top-level
    /// questions pass `None` and are always visible.
    pub fn visible_under(&self, parent: Option<&str>) -> bool {
        match (parent, &self.on) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(answer), Some(trigger)) => answer == trigger,
        }
    }

    pub fn is_yes_no(&self) -> bool {
        matches!(self.kind, QuestionKind::Conditional | QuestionKind::Boolean)
    }

    pub fn is_masked(&self) -> bool {
        self.kind == QuestionKind::Password || self.id == "default_password"
    }

    /// Prompt text rendered as a config key: trailing colon dropped, first
    /// word lowercased unless it is an acronym.
    pub fn key_text(&self) -> String {
        let text = self.text.replace(':', "");
        let text = text.trim();
        let first = text.split_whitespace().next().unwrap_or_default();
        let is_acronym = first.chars().count() > 1
            && first.chars().filter(|c| c.is_alphabetic()).all(char::is_uppercase);
        if is_acronym {
            return text.to_string();
        }
        let mut chars = text.chars();
        match chars.next() {
            Some(c) => c.to_lowercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// Visit every question in the tree, pre-order, regardless of visibility.
pub fn walk<'a>(questions: &'a [Question], visit: &mut dyn FnMut(&'a Question)) {
    for q in questions {
        visit(q);
        walk(&q.questions, visit);
    }
}

/// Accept any YAML/JSON scalar and keep its textual form, so that
/// `on: true` and `on: "true"` compare equal against a `"true"` answer.
fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| scalar_to_string(&v)))
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Commands {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Commands>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Commands::One(command)) => vec![command],
        Some(Commands::Many(commands)) => commands,
    })
}

pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => None,
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        other => serde_yaml::to_string(other).ok().map(|s| s.trim().to_string()),
    }
}
