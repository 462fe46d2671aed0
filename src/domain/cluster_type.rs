//! Deployment profiles discovered from on-disk definitions.
//!
//! Layout of one type directory:
//!
//! ```text
//! <type path>/<dir>/metadata.yaml     id, name, description, questions
//! <type path>/<dir>/state.yaml        { prepared: true } once prepared
//! <type path>/<dir>/prepare.sh        one-time preparation script
//! <type path>/<dir>/identities/*.yaml identity definitions
//! <type path>/<dir>/run_env/          working directory for jobs
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};
use crate::process;

use super::question::Question;

#[derive(Debug, Deserialize)]
struct Metadata {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    questions: Vec<Question>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    prepared: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterType {
    pub id: String,
    pub name: String,
    pub description: String,
    pub questions: Vec<Question>,
    pub base_path: PathBuf,
    prepared: bool,
}

/// A named capability bundle for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Action name → executable.
    #[serde(default)]
    pub commands: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub removable: bool,
    /// Extra variables layered over the job environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Identity {
    pub fn supports(&self, action: &str) -> bool {
        let declared = self.commands.contains_key(action);
        if action == "remove" {
            declared && self.removable
        } else {
            declared
        }
    }

    pub fn command(&self, action: &str) -> Option<&Path> {
        self.commands.get(action).map(PathBuf::as_path)
    }
}

impl ClusterType {
    fn load(dir: &Path) -> Result<Option<Self>> {
        let metadata_file = dir.join("metadata.yaml");
        if !metadata_file.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&metadata_file).with_path("reading", &metadata_file)?;
        let metadata: Metadata = serde_yaml::from_str(&content)?;

        let state_file = dir.join("state.yaml");
        let state = if state_file.is_file() {
            let content = std::fs::read_to_string(&state_file).with_path("reading", &state_file)?;
            serde_yaml::from_str::<Option<State>>(&content)?.unwrap_or_default()
        } else {
            State::default()
        };

        Ok(Some(Self {
            id: metadata.id,
            name: metadata.name,
            description: metadata.description,
            questions: metadata.questions,
            base_path: dir.to_path_buf(),
            prepared: state.prepared,
        }))
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Record a successful preparation run.
    pub fn mark_prepared(&mut self) -> Result<()> {
        let path = self.base_path.join("state.yaml");
        let content = serde_yaml::to_string(&State { prepared: true })?;
        std::fs::write(&path, content).with_path("writing", &path)?;
        self.prepared = true;
        Ok(())
    }

    pub fn prepare_script(&self) -> PathBuf {
        self.base_path.join("prepare.sh")
    }

    /// Working directory handed to jobs as `RUN_ENV`, created on demand.
    pub fn run_env(&self) -> Result<PathBuf> {
        let dir = self.base_path.join("run_env");
        std::fs::create_dir_all(&dir).with_path("creating", &dir)?;
        Ok(dir)
    }

    /// Identities defined under `identities/`, sorted by name. Relative
    /// command paths resolve against this type's directory.
    pub fn identities(&self) -> Result<Vec<Identity>> {
        let dir = self.base_path.join("identities");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_path("listing", &dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        files.sort();

        let mut identities = Vec::with_capacity(files.len());
        for path in files {
            let content = std::fs::read_to_string(&path).with_path("reading", &path)?;
            let mut identity: Identity = serde_yaml::from_str(&content)?;
            for command in identity.commands.values_mut() {
                if command.is_relative() {
                    *command = self.base_path.join(&*command);
                }
            }
            identities.push(identity);
        }
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(identities)
    }

    pub fn find_identity(&self, name: &str) -> Result<Option<Identity>> {
        Ok(self.identities()?.into_iter().find(|i| i.name == name))
    }

    /// Run `prepare.sh` inside the run environment, teeing its output to
    /// `<log_dir>/<id>-<ts>.log`. Exit 0 marks the type prepared.
    pub async fn prepare(&mut self, log_dir: &Path) -> Result<Preparation> {
        let script = self.prepare_script();
        if !script.is_file() {
            return Err(Error::MissingPrepareScript {
                name: self.name.clone(),
                path: script,
            });
        }
        let run_env = self.run_env()?;
        std::fs::create_dir_all(log_dir).with_path("creating", log_dir)?;
        let log = log_dir.join(format!("{}-{}.log", self.id, chrono::Utc::now().timestamp()));

        let child = process::spawn_logged(&script, &BTreeMap::new(), &[log.clone()], Some(&run_env)).await?;
        let exit_code = child.wait().await;
        if exit_code == 0 {
            self.mark_prepared()?;
            debug!(cluster_type = %self.id, "prepared");
        } else {
            warn!(cluster_type = %self.id, exit_code, log = %log.display(), "preparation failed");
        }
        Ok(Preparation { exit_code, log })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preparation {
    pub exit_code: i32,
    pub log: PathBuf,
}

/// Every cluster type discovered at startup.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Vec<ClusterType>,
}

impl TypeRegistry {
    /// Scan each type path for `<dir>/metadata.yaml`. Two definitions sharing
    /// an id is fatal; every duplicated id is reported.
    pub fn discover(type_paths: &[PathBuf]) -> Result<Self> {
        let mut types = Vec::new();
        for root in type_paths {
            if !root.is_dir() {
                debug!(path = %root.display(), "type path does not exist, skipping");
                continue;
            }
            let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
                .with_path("listing", root)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();

            for dir in dirs {
                match ClusterType::load(&dir) {
                    Ok(Some(t)) => types.push(t),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "skipping unreadable cluster type");
                    }
                }
            }
        }

        let mut duplicates: Vec<String> = Vec::new();
        for (i, t) in types.iter().enumerate() {
            let repeated = types.iter().skip(i + 1).any(|u| u.id == t.id);
            if repeated && !duplicates.contains(&t.id) {
                duplicates.push(t.id.clone());
            }
        }
        if !duplicates.is_empty() {
            duplicates.sort();
            return Err(Error::DuplicateClusterTypes(duplicates));
        }

        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { types })
    }

    pub fn all(&self) -> &[ClusterType] {
        &self.types
    }

    /// Look up by name or id.
    pub fn get(&self, key: &str) -> Option<&ClusterType> {
        self.types.iter().find(|t| t.name == key || t.id == key)
    }

    /// First key (in order) that names a known type.
    pub fn find<'k>(&self, keys: impl IntoIterator<Item = Option<&'k str>>) -> Option<&ClusterType> {
        keys.into_iter().flatten().find_map(|k| self.get(k))
    }

    pub fn require(&self, key: &str) -> Result<&ClusterType> {
        self.get(key)
            .ok_or_else(|| Error::UnknownClusterType(key.to_string()))
    }
}
