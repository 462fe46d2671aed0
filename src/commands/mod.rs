pub mod configure;
pub mod deploy;
pub mod list;
pub mod prepare;
pub mod supervise;
pub mod types;
pub mod view;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use stoke::config::{self, Settings};
use stoke::domain::cluster_type::{ClusterType, TypeRegistry};
use stoke::domain::node_registry::NodeRegistry;
use stoke::store::{self, AnswerStore};
use stoke::Error;

/// Settings plus the stores every command works against.
pub struct Context {
    pub settings: Settings,
    pub types: TypeRegistry,
    pub answers: AnswerStore,
    pub registry: Arc<NodeRegistry>,
}

impl Context {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let settings = config::load(config_path)?;
        stoke::logging::init_cli(&settings.log_level);
        let types = TypeRegistry::discover(&settings.type_paths)?;
        Ok(Self {
            answers: AnswerStore::new(&settings.answers_dir),
            registry: Arc::new(NodeRegistry::new(settings.nodes_file())),
            types,
            settings,
        })
    }

    pub fn selected_id(&self) -> Result<Option<String>> {
        Ok(store::selected_type(&self.settings.selection_file())?)
    }

    /// The cluster type chosen by the last `configure`.
    pub fn selected_type(&self) -> Result<&ClusterType> {
        let id = self.selected_id()?.ok_or(Error::NotConfigured)?;
        Ok(self.types.require(&id)?)
    }
}
