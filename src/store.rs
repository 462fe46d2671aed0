//! File-backed answer and selection stores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, Result};

pub type Answers = BTreeMap<String, String>;

/// Saved answers, one YAML mapping per cluster type id.
#[derive(Debug, Clone)]
pub struct AnswerStore {
    dir: PathBuf,
}

impl AnswerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, type_id: &str) -> PathBuf {
        self.dir.join(format!("{type_id}.yaml"))
    }

    /// Saved answers for a type. A missing file is an empty mapping.
    pub fn load(&self, type_id: &str) -> Result<Answers> {
        let path = self.path(type_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Answers::new()),
            Err(e) => return Err(e).with_path("reading", &path),
        };
        let raw: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(&content)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| crate::domain::question::scalar_to_string(&v).map(|v| (k, v)))
            .collect())
    }

    /// Merge `answers` over the saved ones and write the result.
    pub fn save(&self, type_id: &str, answers: &Answers) -> Result<Answers> {
        let mut merged = self.load(type_id)?;
        merged.extend(answers.iter().map(|(k, v)| (k.clone(), v.clone())));

        std::fs::create_dir_all(&self.dir).with_path("creating", &self.dir)?;
        let path = self.path(type_id);
        std::fs::write(&path, serde_yaml::to_string(&merged)?).with_path("writing", &path)?;
        Ok(merged)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectionFile {
    #[serde(default)]
    cluster_type: Option<String>,
}

/// The process-wide selected cluster type id.
pub fn selected_type(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).with_path("reading", path)?;
    let file: Option<SelectionFile> = serde_yaml::from_str(&content)?;
    Ok(file.and_then(|f| f.cluster_type))
}

pub fn select_type(path: &Path, type_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path("creating", parent)?;
    }
    let file = SelectionFile {
        cluster_type: Some(type_id.to_string()),
    };
    std::fs::write(path, serde_yaml::to_string(&file)?).with_path("writing", path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_answers_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnswerStore::new(dir.path().join("answers"));
        assert!(store.load("k8s").unwrap().is_empty());
    }

    #[test]
    fn save_merges_over_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnswerStore::new(dir.path());
        store
            .save("k8s", &Answers::from([("a".into(), "1".into()), ("b".into(), "2".into())]))
            .unwrap();
        let merged = store
            .save("k8s", &Answers::from([("b".into(), "3".into())]))
            .unwrap();
        assert_eq!(merged.get("a").map(String::as_str), Some("1"));
        assert_eq!(store.load("k8s").unwrap().get("b").map(String::as_str), Some("3"));
    }

    #[test]
    fn scalar_answers_are_stringified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k8s.yaml"), "ha: true\nreplicas: 3\nname: c1\n").unwrap();
        let answers = AnswerStore::new(dir.path()).load("k8s").unwrap();
        assert_eq!(answers["ha"], "true");
        assert_eq!(answers["replicas"], "3");
    }

    #[test]
    fn selection_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/selection.yaml");
        assert_eq!(selected_type(&path).unwrap(), None);
        select_type(&path, "k8s").unwrap();
        assert_eq!(selected_type(&path).unwrap().as_deref(), Some("k8s"));
    }
}
