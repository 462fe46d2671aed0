//! Interactive input boundary.

use colored::Colorize;
use dialoguer::{Confirm, Input, Password};
use regex::Regex;

use crate::error::{Error, Result};

/// Minimum length accepted for masked answers.
pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    YesNo,
    Masked,
    Text,
}

/// One question as presented to the user.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub id: String,
    pub text: String,
    pub kind: PromptKind,
    pub default: String,
    pub required: bool,
    pub format: Option<Regex>,
    pub message: Option<String>,
}

impl Prompt {
    /// Check a candidate answer; `Err` carries the message to show.
    pub fn check(&self, value: &str) -> std::result::Result<(), String> {
        if self.required && value.is_empty() {
            return Err("Value is required".to_string());
        }
        match self.kind {
            PromptKind::Masked if value.chars().count() < MIN_PASSWORD_LEN => Err(format!(
                "Invalid Password: Minimum {MIN_PASSWORD_LEN} Characters"
            )),
            PromptKind::Text => match &self.format {
                Some(re) if !value.is_empty() && !re.is_match(value) => Err(self
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Value must match {}", re.as_str()))),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

/// Something that can answer prompts. Yes/no answers are `"true"`/`"false"`.
pub trait Prompter: Send + Sync {
    fn ask(&self, prompt: &Prompt) -> Result<String>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&self, prompt: &Prompt) -> Result<String> {
        let failed = |e: dialoguer::Error| Error::Prompt(e.to_string());
        match prompt.kind {
            PromptKind::YesNo => {
                let default = matches!(prompt.default.as_str(), "true" | "yes" | "y");
                let answer = Confirm::new()
                    .with_prompt(&prompt.text)
                    .default(default)
                    .interact()
                    .map_err(failed)?;
                Ok(answer.to_string())
            }
            PromptKind::Masked => loop {
                let entered = Password::new()
                    .with_prompt(&prompt.text)
                    .allow_empty_password(!prompt.default.is_empty())
                    .interact()
                    .map_err(failed)?;
                let value = if entered.is_empty() {
                    prompt.default.clone()
                } else {
                    entered
                };
                match prompt.check(&value) {
                    Ok(()) => return Ok(value),
                    Err(msg) => eprintln!("{} {}", "!!".red().bold(), msg),
                }
            },
            PromptKind::Text => {
                let checked = prompt.clone();
                let validator = move |v: &String| checked.check(v);
                let answer = if prompt.default.is_empty() {
                    Input::<String>::new()
                        .with_prompt(&prompt.text)
                        .allow_empty(!prompt.required)
                        .validate_with(validator)
                        .interact_text()
                } else {
                    Input::<String>::new()
                        .with_prompt(&prompt.text)
                        .default(prompt.default.clone())
                        .validate_with(validator)
                        .interact_text()
                };
                answer.map_err(failed)
            }
        }
    }
}
