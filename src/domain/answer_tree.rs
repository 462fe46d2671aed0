//! Resolves a cluster type's question tree into a flat answer
//! map, following conditional branches.
//!
//! Only questions reachable along the actual answer path ever appear in the
//! result: a child is considered only after its parent resolved to the
//! child's trigger value.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::prompt::{Prompt, PromptKind, Prompter};
use crate::store::Answers;

use super::prefill::PrefillMap;
use super::question::Question;

pub struct AnswerTree<'q> {
    questions: &'q [Question],
}

/// Saved answers mapped to their environment names, plus the prompts of
/// every reachable question that has no answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredAnswers {
    pub env: BTreeMap<String, String>,
    pub missing: Vec<String>,
}

impl RequiredAnswers {
    pub fn into_env(self) -> Result<BTreeMap<String, String>> {
        if self.missing.is_empty() {
            Ok(self.env)
        } else {
            Err(Error::MissingAnswers(self.missing))
        }
    }
}

impl<'q> AnswerTree<'q> {
    pub fn new(questions: &'q [Question]) -> Self {
        Self { questions }
    }

    /// Ids reachable when the tree is walked with `answers`, pre-order.
    pub fn reachable_ids(&self, answers: &Answers) -> Vec<String> {
        let mut out = Vec::new();
        self.visit(self.questions, None, answers, &mut |q| out.push(q.id.clone()));
        out
    }

    fn visit<'a>(
        &self,
        questions: &'a [Question],
        parent: Option<&str>,
        answers: &Answers,
        f: &mut dyn FnMut(&'a Question),
    ) {
        for q in questions.iter().filter(|q| q.visible_under(parent)) {
            f(q);
            if let Some(answer) = answers.get(&q.id) {
                self.visit(&q.questions, Some(answer), answers, f);
            }
        }
    }

    // ── Pre-supplied answers ───────────────────────────────

    /// Accept a complete, pre-supplied answer map. The keys must be exactly
    /// the reachable ids and every value must pass its format rule.
    pub fn resolve_supplied(&self, supplied: Answers) -> Result<Answers> {
        self.check_keys(&supplied)?;
        self.validate(&supplied)?;
        Ok(supplied)
    }

    /// Missing and extra keys, both reported in one error.
    pub fn check_keys(&self, supplied: &Answers) -> Result<()> {
        let reachable = self.reachable_ids(supplied);
        let reachable_set: BTreeSet<&str> = reachable.iter().map(String::as_str).collect();

        let missing: Vec<String> = reachable
            .iter()
            .filter(|id| !supplied.contains_key(*id))
            .cloned()
            .collect();
        let extra: Vec<String> = supplied
            .keys()
            .filter(|k| !reachable_set.contains(k.as_str()))
            .cloned()
            .collect();

        if missing.is_empty() && extra.is_empty() {
            Ok(())
        } else {
            Err(Error::AnswerMismatch { missing, extra })
        }
    }

    /// Re-check reachable answers against their format rules, naming every
    /// failing id.
    pub fn validate(&self, answers: &Answers) -> Result<()> {
        let mut reachable = Vec::new();
        self.visit(self.questions, None, answers, &mut |q| reachable.push(q));

        let mut bad = Vec::new();
        for q in reachable {
            if let (Some(re), Some(value)) = (q.format()?, answers.get(&q.id)) {
                if !re.is_match(value) {
                    bad.push(q.id.clone());
                }
            }
        }
        if bad.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidAnswers(bad))
        }
    }

    /// Fill every reachable question that has no supplied answer from the
    /// prefills, descending into branches the filled values open.
    pub fn fill_defaults(&self, supplied: &mut Answers, prefills: &BTreeMap<String, String>) {
        fill(self.questions, None, supplied, prefills);
    }

    // ── Interactive ────────────────────────────────────────

    /// Ask every reachable question, pre-order. Each prompt waits for its
    /// prefill so the best available default is shown.
    pub fn resolve_interactive(&self, prompter: &dyn Prompter, prefills: &PrefillMap) -> Result<Answers> {
        let mut answers = Answers::new();
        self.ask(self.questions, None, prompter, prefills, &mut answers)?;
        Ok(answers)
    }

    fn ask(
        &self,
        questions: &[Question],
        parent: Option<&str>,
        prompter: &dyn Prompter,
        prefills: &PrefillMap,
        answers: &mut Answers,
    ) -> Result<()> {
        for q in questions.iter().filter(|q| q.visible_under(parent)) {
            let default = prefills.wait_for(&q.id);
            let kind = if q.is_yes_no() {
                PromptKind::YesNo
            } else if q.is_masked() {
                PromptKind::Masked
            } else {
                PromptKind::Text
            };
            let prompt = Prompt {
                id: q.id.clone(),
                text: q.text.clone(),
                kind,
                default,
                required: q.validation.required,
                format: q.format()?,
                message: q.validation.message.clone(),
            };

            let value = prompter.ask(&prompt)?;
            answers.insert(q.id.clone(), value.clone());
            self.ask(&q.questions, Some(&value), prompter, prefills, answers)?;
        }
        Ok(())
    }

    // ── Saved answers ──────────────────────────────────────

    /// Walk the tree against saved answers. Children of an unanswered
    /// question are not reachable and so never reported missing.
    pub fn required(&self, saved: &Answers) -> RequiredAnswers {
        let mut required = RequiredAnswers::default();
        self.visit(self.questions, None, saved, &mut |q| match saved.get(&q.id) {
            Some(value) => {
                required.env.insert(q.env_name(), value.clone());
            }
            None => required.missing.push(q.key_text()),
        });
        required
    }

    /// Prompt text and saved value of every reachable question.
    pub fn summary(&self, saved: &Answers) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        self.visit(self.questions, None, saved, &mut |q| {
            out.push((q.text.clone(), saved.get(&q.id).cloned()))
        });
        out
    }
}

fn fill(
    questions: &[Question],
    parent: Option<&str>,
    answers: &mut Answers,
    prefills: &BTreeMap<String, String>,
) {
    for q in questions.iter().filter(|q| q.visible_under(parent)) {
        if !answers.contains_key(&q.id) {
            if let Some(value) = prefills.get(&q.id) {
                answers.insert(q.id.clone(), value.clone());
            }
        }
        if let Some(value) = answers.get(&q.id).cloned() {
            fill(&q.questions, Some(&value), answers, prefills);
        }
    }
}

/// Parse a JSON object of answers. Scalars are stringified; nulls count as
/// absent.
pub fn answers_from_json(json: &str) -> Result<Answers> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| {
            let value = match v {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Some((k, value))
        })
        .collect())
}
