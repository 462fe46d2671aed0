//! Best-effort defaults for every question, computed ahead of
//! interactive resolution.
//!
//! Each question resolves in its own task: saved answer, else a validated
//! smart-default probe, else the static default, else an empty string.
//! Results land in a [`PrefillMap`] that the interactive walk blocks on.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::process::run_probe;
use crate::store::Answers;

use super::question::{walk, Question};

/// Prefill values keyed by question id, shared between the probing tasks
/// and the interactive walk.
#[derive(Debug, Default)]
pub struct PrefillMap {
    values: Mutex<HashMap<String, String>>,
    published: Condvar,
}

impl PrefillMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, id: &str, value: String) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(id.to_string(), value);
        self.published.notify_all();
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Block the calling thread until `id` has been published.
    pub fn wait_for(&self, id: &str) -> String {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let values = self
            .published
            .wait_while(values, |v| !v.contains_key(id))
            .unwrap_or_else(|e| e.into_inner());
        values.get(id).cloned().unwrap_or_default()
    }

    /// Publish an empty value for every id that has none yet.
    pub fn fill_missing<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            values.entry(id.to_string()).or_default();
        }
        self.published.notify_all();
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PrefillResolver {
    saved: Answers,
    timeout: Duration,
}

impl PrefillResolver {
    pub fn new(saved: Answers, timeout: Duration) -> Self {
        Self { saved, timeout }
    }

    /// Resolve every question in the tree concurrently, publishing into
    /// `map` as each finishes. On return every id has an entry.
    pub async fn resolve(&self, questions: &[Question], map: Arc<PrefillMap>) {
        let mut all: Vec<Question> = Vec::new();
        walk(questions, &mut |q| all.push(q.clone()));
        let ids: Vec<String> = all.iter().map(|q| q.id.clone()).collect();

        let mut tasks = JoinSet::new();
        for question in all {
            let saved = self.saved.get(&question.id).cloned();
            let timeout = self.timeout;
            let map = map.clone();
            tasks.spawn(async move {
                let value = prefill(&question, saved, timeout).await;
                map.publish(&question.id, value);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "prefill task failed");
            }
        }

        map.fill_missing(ids.iter().map(String::as_str));
    }
}

/// Best default for one question.
pub async fn prefill(question: &Question, saved: Option<String>, timeout: Duration) -> String {
    if let Some(saved) = saved {
        return saved;
    }
    let fallback = question.default.clone().unwrap_or_default();
    if question.default_smart.is_empty() {
        return fallback;
    }

    let format = match question.format() {
        Ok(format) => format,
        Err(e) => {
            warn!(question = %question.id, error = %e, "invalid format rule");
            return fallback;
        }
    };
    match best_command_output(&question.default_smart, format.as_ref(), timeout).await {
        Some(output) => output,
        None => {
            debug!(question = %question.text, "no smart default, using static default");
            fallback
        }
    }
}

/// Run every candidate command concurrently and return the output of the
/// first one, in declared order, that succeeded and matches `regex`.
pub async fn best_command_output(
    commands: &[String],
    regex: Option<&Regex>,
    timeout: Duration,
) -> Option<String> {
    let mut handles: Vec<_> = commands
        .iter()
        .cloned()
        .map(|command| {
            tokio::spawn(async move { run_probe(&command, &BTreeMap::new(), timeout).await })
        })
        .collect();

    let mut chosen = None;
    for (command, handle) in commands.iter().zip(handles.iter_mut()) {
        let output = match handle.await {
            Ok(o) => o,
            Err(e) => {
                warn!(command = %command, error = %e, "probe task failed");
                continue;
            }
        };
        if !output.success {
            debug!(command = %command, stderr = %output.stderr.escape_debug(), "command failed");
        } else if regex.map_or(true, |re| re.is_match(&output.stdout)) {
            chosen = Some(output.stdout);
            break;
        } else {
            debug!(output = %output.stdout, "command result did not pass validation");
        }
    }

    for handle in &handles {
        handle.abort();
    }
    chosen
}
