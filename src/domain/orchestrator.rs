//! Turns an `apply` or `remove` request into one external
//! job per identity and folds each job's exit back into the node registry.
//!
//! A blocking request owns its jobs directly and waits for all of them.
//! A detached request hands each job to a `stoke supervise` process which
//! owns it until exit and performs the same completion.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, IoContext, Result};
use crate::hostrange;
use crate::inventory::{HunterCli, HunterNotifier, Inventory};
use crate::process::{self, LoggedChild};
use crate::store::Answers;

use super::answer_tree::AnswerTree;
use super::cluster_type::{ClusterType, Identity};
use super::node::{Node, NodeStatus, NodeUpdate};
use super::node_registry::{NodeGroup, NodeRegistry};
use super::recovery::RecoveryGuard;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Assign `identity` to the targets and run its `apply` command.
    Apply { identity: String },
    /// Run each target's `remove` command; success drops the node records.
    Remove,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Apply { .. } => "apply",
            Self::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub action: Action,
    /// Host-range expression, e.g. `node[01-03],gpu1`.
    pub targets: String,
    pub wait: bool,
    pub force: bool,
    pub remove_hunter_entry: bool,
}

/// Everything needed to run one partition's job and complete it, possibly
/// in another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub action: String,
    pub program: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_files: Vec<PathBuf>,
    pub nodes: Vec<String>,
    pub registry: PathBuf,
    /// Set when a successful removal should drop the nodes from hunter.
    #[serde(default)]
    pub hunter_command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl JobSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path("reading job spec", path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn is_removal(&self) -> bool {
        self.action == "remove"
    }
}

/// Starts a job that outlives the calling process.
pub trait DetachedLauncher: Send + Sync {
    /// Returns the pid that owns the job.
    fn launch(&self, spec: &JobSpec) -> Result<u32>;
}

/// Writes the spec under the jobs directory and starts `stoke supervise`.
#[derive(Debug, Clone)]
pub struct SupervisorLauncher {
    jobs_dir: PathBuf,
}

impl SupervisorLauncher {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }
}

impl DetachedLauncher for SupervisorLauncher {
    fn launch(&self, spec: &JobSpec) -> Result<u32> {
        std::fs::create_dir_all(&self.jobs_dir).with_path("creating", &self.jobs_dir)?;
        let first = spec.nodes.first().map(String::as_str).unwrap_or("job");
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let path = self
            .jobs_dir
            .join(format!("{}-{first}-{stamp}.yaml", spec.action));
        std::fs::write(&path, serde_yaml::to_string(spec)?).with_path("writing job spec", &path)?;
        process::launch_supervisor(&path)
    }
}

/// What was dispatched for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub identity: String,
    pub nodes: Vec<String>,
    /// `None` when the job could not be started.
    pub pid: Option<u32>,
    /// Known when the request waited or the job could not be started.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub action: String,
    pub partitions: Vec<PartitionOutcome>,
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        self.partitions.iter().all(|p| p.exit_code.unwrap_or(0) == 0)
    }
}

struct Partition {
    identity: Identity,
    nodes: Vec<Node>,
}

pub struct JobOrchestrator {
    settings: Settings,
    registry: Arc<NodeRegistry>,
    guard: RecoveryGuard,
    hunter: Arc<dyn HunterNotifier>,
    launcher: Arc<dyn DetachedLauncher>,
}

impl JobOrchestrator {
    pub fn new(settings: Settings, registry: Arc<NodeRegistry>) -> Self {
        let hunter = Arc::new(HunterCli::new(&settings.hunter.command));
        let launcher = Arc::new(SupervisorLauncher::new(settings.jobs_dir()));
        Self {
            settings,
            registry,
            guard: RecoveryGuard::default(),
            hunter,
            launcher,
        }
    }

    pub fn with_guard(mut self, guard: RecoveryGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_hunter(mut self, hunter: Arc<dyn HunterNotifier>) -> Self {
        self.hunter = hunter;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn DetachedLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Run `request` against `cluster_type` using its saved `answers`.
    pub async fn deploy(
        &self,
        cluster_type: &ClusterType,
        answers: &Answers,
        request: &DeployRequest,
    ) -> Result<Outcome> {
        let action = request.action.name();
        let names = hostrange::expand(&request.targets)?;

        if !cluster_type.is_prepared() {
            return Err(Error::NotPrepared(cluster_type.id.clone()));
        }

        let (existing, partitions) = match &request.action {
            Action::Remove => self.removal_partitions(cluster_type, &names)?,
            Action::Apply { identity } => {
                let (existing, partition) = self.apply_partition(cluster_type, identity, &names)?;
                (existing, vec![partition])
            }
        };

        self.guard.check(&existing, request.force)?;

        let answer_env = AnswerTree::new(&cluster_type.questions)
            .required(answers)
            .into_env()?;

        let partitions = match &request.action {
            Action::Apply { .. } => partitions
                .into_iter()
                .map(|p| self.assign_identity(p))
                .collect::<Result<Vec<_>>>()?,
            Action::Remove => partitions,
        };

        let cluster_name = answers
            .get("cluster_name")
            .cloned()
            .unwrap_or_else(|| cluster_type.id.clone());
        let inventory = Inventory::new(&self.settings.inventory_dir).load(&cluster_name)?;
        let run_env = cluster_type.run_env()?;
        let action_log_dir = self.settings.log_dir.join(action);

        let base_env = BTreeMap::from([
            (
                "ANSIBLE_CALLBACK_PLUGINS".to_string(),
                self.settings.ansible_callback_dir.display().to_string(),
            ),
            ("ANSIBLE_STDOUT_CALLBACK".to_string(), "log_plays_v2".to_string()),
            ("ANSIBLE_DISPLAY_SKIPPED_HOSTS".to_string(), "false".to_string()),
            ("ANSIBLE_HOST_KEY_CHECKING".to_string(), "false".to_string()),
            ("INVFILE".to_string(), inventory.display().to_string()),
            ("RUN_ENV".to_string(), run_env.display().to_string()),
            (
                "HUNTER_HOSTS".to_string(),
                self.settings.hunter.enabled.to_string(),
            ),
            (
                "ANSIBLE_LOG_FOLDER".to_string(),
                action_log_dir.display().to_string(),
            ),
        ]);

        let notify_hunter = request.action == Action::Remove
            && self.settings.hunter.enabled
            && (self.settings.hunter.remove_entry || request.remove_hunter_entry);

        let mut specs = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let log_files = prepare_logs(&self.settings.log_dir, action, &partition.nodes)?;
            let program = partition
                .identity
                .command(action)
                .map(Path::to_path_buf)
                .ok_or_else(|| Error::UnsupportedAction {
                    action: action.to_string(),
                    nodes: partition.nodes.iter().map(|n| n.name.clone()).collect(),
                })?;

            let mut env = base_env.clone();
            env.insert(
                "NODE".to_string(),
                partition
                    .nodes
                    .iter()
                    .map(|n| n.hostname.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            );
            env.extend(answer_env.clone());
            env.extend(partition.identity.env.clone());

            specs.push(JobSpec {
                action: action.to_string(),
                program,
                env,
                log_files,
                nodes: partition.nodes.iter().map(|n| n.name.clone()).collect(),
                registry: self.registry.path().to_path_buf(),
                hunter_command: notify_hunter.then(|| self.settings.hunter.command.clone()),
                working_dir: Some(run_env.clone()),
                log_dir: self.settings.log_dir.clone(),
                log_level: self.settings.log_level.clone(),
            });
        }

        info!(
            action,
            nodes = %names.join(","),
            partitions = specs.len(),
            wait = request.wait,
            "dispatching jobs"
        );

        let partitions = if request.wait {
            self.run_blocking(&partitions, specs).await?
        } else {
            self.run_detached(&partitions, &specs)?
        };

        Ok(Outcome {
            action: action.to_string(),
            partitions,
        })
    }

    /// Every target must exist with an identity that can be removed.
    fn removal_partitions(
        &self,
        cluster_type: &ClusterType,
        names: &[String],
    ) -> Result<(Vec<Node>, Vec<Partition>)> {
        let mut nodes = Vec::with_capacity(names.len());
        let mut not_found = Vec::new();
        for name in names {
            match self.registry.find(name)? {
                Some(node) if node.identity.is_some() => nodes.push(node),
                _ => not_found.push(name.clone()),
            }
        }
        if !not_found.is_empty() {
            return Err(Error::NodesNotFound(not_found));
        }

        let identities: HashMap<String, Identity> = cluster_type
            .identities()?
            .into_iter()
            .map(|i| (i.name.clone(), i))
            .collect();

        let mut partitions: Vec<Partition> = Vec::new();
        let mut unsupported = Vec::new();
        for node in &nodes {
            let identity = node
                .identity
                .as_deref()
                .and_then(|name| identities.get(name))
                .filter(|i| i.supports("remove"));
            let Some(identity) = identity else {
                unsupported.push(node.name.clone());
                continue;
            };
            match partitions.iter_mut().find(|p| p.identity.name == identity.name) {
                Some(partition) => partition.nodes.push(node.clone()),
                None => partitions.push(Partition {
                    identity: identity.clone(),
                    nodes: vec![node.clone()],
                }),
            }
        }
        if !unsupported.is_empty() {
            return Err(Error::UnsupportedAction {
                action: "remove".to_string(),
                nodes: unsupported,
            });
        }

        Ok((nodes, partitions))
    }

    /// All targets share the named identity; only nodes already on record
    /// can be busy.
    fn apply_partition(
        &self,
        cluster_type: &ClusterType,
        identity: &str,
        names: &[String],
    ) -> Result<(Vec<Node>, Partition)> {
        let identity = cluster_type
            .find_identity(identity)?
            .ok_or_else(|| Error::UnknownIdentity {
                identity: identity.to_string(),
                cluster_type: cluster_type.id.clone(),
            })?;
        if !identity.supports("apply") {
            return Err(Error::UnsupportedAction {
                action: "apply".to_string(),
                nodes: names.to_vec(),
            });
        }

        let mut existing = Vec::new();
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            match self.registry.find(name)? {
                Some(node) => {
                    existing.push(node.clone());
                    nodes.push(node);
                }
                None => nodes.push(Node::new(name.as_str(), name.as_str())),
            }
        }
        Ok((existing, Partition { identity, nodes }))
    }

    /// Create or re-point the targets' records, leaving them idle.
    fn assign_identity(&self, mut partition: Partition) -> Result<Partition> {
        let update = NodeUpdate {
            identity: Some(Some(partition.identity.name.clone())),
            status: Some(NodeStatus::Idle),
            deployment_pid: Some(None),
            ..Default::default()
        };
        let nodes = self.registry.transaction(|records| {
            partition
                .nodes
                .iter()
                .map(|node| {
                    let record = records
                        .entry(node.name.clone())
                        .or_insert_with(|| node.clone());
                    record.apply(&update);
                    record.clone()
                })
                .collect::<Vec<_>>()
        })?;
        partition.nodes = nodes;
        Ok(partition)
    }

    /// Spawn every partition, record ownership, then wait for all of them.
    /// A partition whose job cannot be started is recorded as failed and the
    /// rest still run.
    async fn run_blocking(
        &self,
        partitions: &[Partition],
        specs: Vec<JobSpec>,
    ) -> Result<Vec<PartitionOutcome>> {
        let mut outcomes = Vec::with_capacity(specs.len());
        let mut running = JoinSet::new();
        for (index, spec) in specs.iter().enumerate() {
            let group = NodeGroup::new(spec.nodes.clone());
            let mut outcome = PartitionOutcome {
                identity: partitions[index].identity.name.clone(),
                nodes: spec.nodes.clone(),
                pid: None,
                exit_code: None,
            };

            match spawn_job(spec).await {
                Ok(child) => {
                    let pid = child.pid();
                    outcome.pid = Some(pid);
                    let dispatched = NodeUpdate::dispatched(pid, &spec.action);
                    if let Err(e) = group.update_all(&self.registry, &dispatched) {
                        warn!(pid, error = %e, "failed to record job ownership");
                    }
                    running.spawn(async move { (index, pid, child.wait().await) });
                }
                Err(e) => {
                    warn!(
                        action = %spec.action,
                        nodes = %spec.nodes.join(","),
                        error = %e,
                        "failed to start job"
                    );
                    let failed = NodeUpdate::finished(process::SPAWN_FAILED);
                    if let Err(e) = group.update_all(&self.registry, &failed) {
                        warn!(error = %e, "failed to record job start failure");
                    }
                    outcome.exit_code = Some(process::SPAWN_FAILED);
                }
            }
            outcomes.push(outcome);
        }

        while let Some(joined) = running.join_next().await {
            let (index, pid, code) = joined?;
            let spec = &specs[index];
            info!(action = %spec.action, nodes = %spec.nodes.join(","), code, "job finished");
            complete(&self.registry, spec, pid, code, Some(self.hunter.as_ref())).await?;
            outcomes[index].exit_code = Some(code);
        }
        Ok(outcomes)
    }

    /// Hand every partition to a supervisor and record it as the owner.
    fn run_detached(
        &self,
        partitions: &[Partition],
        specs: &[JobSpec],
    ) -> Result<Vec<PartitionOutcome>> {
        let mut outcomes = Vec::with_capacity(specs.len());
        for (partition, spec) in partitions.iter().zip(specs) {
            let group = NodeGroup::new(spec.nodes.clone());
            group.update_all(
                &self.registry,
                &NodeUpdate {
                    status: Some(NodeStatus::InProgress),
                    deployment_pid: Some(None),
                    last_action: Some(Some(spec.action.clone())),
                    ..Default::default()
                },
            )?;

            let pid = match self.launcher.launch(spec) {
                Ok(pid) => pid,
                Err(e) => {
                    warn!(
                        action = %spec.action,
                        nodes = %spec.nodes.join(","),
                        error = %e,
                        "failed to start supervisor"
                    );
                    group.update_all(&self.registry, &NodeUpdate::finished(process::SPAWN_FAILED))?;
                    outcomes.push(PartitionOutcome {
                        identity: partition.identity.name.clone(),
                        nodes: spec.nodes.clone(),
                        pid: None,
                        exit_code: Some(process::SPAWN_FAILED),
                    });
                    continue;
                }
            };

            // The supervisor may already have finished; only claim nodes
            // it has not yet released.
            self.registry.transaction(|records| {
                for name in &spec.nodes {
                    if let Some(node) = records.get_mut(name) {
                        if node.status == NodeStatus::InProgress && node.deployment_pid.is_none() {
                            node.deployment_pid = Some(pid);
                        }
                    }
                }
            })?;

            info!(action = %spec.action, nodes = %spec.nodes.join(","), pid, "job detached");
            outcomes.push(PartitionOutcome {
                identity: partition.identity.name.clone(),
                nodes: spec.nodes.clone(),
                pid: Some(pid),
                exit_code: None,
            });
        }
        Ok(outcomes)
    }
}

/// Truncate `<log_dir>/<action>/<hostname>` for every node and point a fresh
/// `<log_dir>/<name>-<action>-<ts>.log` symlink at it.
fn prepare_logs(log_dir: &Path, action: &str, nodes: &[Node]) -> Result<Vec<PathBuf>> {
    let action_dir = log_dir.join(action);
    std::fs::create_dir_all(&action_dir).with_path("creating", &action_dir)?;
    let stamp = chrono::Utc::now().timestamp();

    let mut files = Vec::with_capacity(nodes.len());
    for node in nodes {
        let log = action_dir.join(&node.hostname);
        std::fs::File::create(&log).with_path("creating log file", &log)?;

        let link = log_dir.join(format!("{}-{action}-{stamp}.log", node.name));
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link).with_path("replacing", &link)?;
        }
        std::os::unix::fs::symlink(&log, &link).with_path("linking", &link)?;
        files.push(log);
    }
    Ok(files)
}

/// Start the job described by `spec`.
pub async fn spawn_job(spec: &JobSpec) -> Result<LoggedChild> {
    process::spawn_logged(
        &spec.program,
        &spec.env,
        &spec.log_files,
        spec.working_dir.as_deref(),
    )
    .await
}

/// Record a job's exit on the nodes `owner` still holds, in one transaction.
/// Nodes since re-dispatched to another job are left alone. A successful
/// removal drops the released nodes and, when asked, notifies hunter once
/// for them.
pub async fn complete(
    registry: &NodeRegistry,
    spec: &JobSpec,
    owner: u32,
    code: i32,
    hunter: Option<&dyn HunterNotifier>,
) -> Result<()> {
    let group = NodeGroup::new(spec.nodes.clone());
    let delete = code == 0 && spec.is_removal();
    let released = group.release(registry, owner, &NodeUpdate::finished(code), delete)?;
    if released.len() < spec.nodes.len() {
        warn!(
            owner,
            nodes = %spec.nodes.join(","),
            released = %released.join(","),
            "some nodes now belong to another job"
        );
    }
    if !delete || released.is_empty() {
        return Ok(());
    }

    let names = released.join(",");
    info!(nodes = %names, "removed node records");
    if let (Some(_), Some(hunter)) = (&spec.hunter_command, hunter) {
        if let Err(e) = hunter.remove_nodes(&names).await {
            warn!(nodes = %names, error = %e, "failed to remove hunter entries");
        }
    }
    Ok(())
}

/// Own a detached job until it exits: forward SIGHUP to it, then complete.
pub async fn supervise(spec: &JobSpec) -> Result<i32> {
    let registry = NodeRegistry::new(&spec.registry);
    let hunter = spec.hunter_command.as_deref().map(HunterCli::new);
    let owner = std::process::id();

    let child = match spawn_job(spec).await {
        Ok(child) => child,
        Err(e) => {
            warn!(action = %spec.action, nodes = %spec.nodes.join(","), error = %e, "failed to start job");
            complete(&registry, spec, owner, process::SPAWN_FAILED, None).await?;
            return Ok(process::SPAWN_FAILED);
        }
    };
    let pid = child.pid();
    info!(action = %spec.action, nodes = %spec.nodes.join(","), pid, "supervising job");

    let mut hangup =
        signal(SignalKind::hangup()).map_err(|e| Error::io("installing SIGHUP handler", e))?;
    let wait = child.wait();
    tokio::pin!(wait);
    let code = loop {
        tokio::select! {
            code = &mut wait => break code,
            Some(()) = hangup.recv() => {
                info!(pid, "forwarding SIGHUP to job");
                if let Err(e) = process::send_hangup(pid) {
                    warn!(pid, error = %e, "failed to forward SIGHUP");
                }
            }
        }
    };

    info!(action = %spec.action, code, "job finished");
    complete(
        &registry,
        spec,
        owner,
        code,
        hunter.as_ref().map(|h| h as &dyn HunterNotifier),
    )
    .await?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::domain::cluster_type::tests::write_type;
    use crate::domain::cluster_type::TypeRegistry;
    use crate::domain::recovery::tests::RecordingSignaller;
    use crate::inventory::tests::RecordingHunter;
    use crate::test_support::script;

    struct Fixture {
        _root: tempfile::TempDir,
        settings: Settings,
        cluster_type: ClusterType,
        registry: Arc<NodeRegistry>,
        hunter: Arc<RecordingHunter>,
        signaller: Arc<RecordingSignaller>,
    }

    const QUESTIONS: &str = "  - id: cluster_name\n    text: \"Cluster name:\"\n    env: CLUSTER\n";

    /// A prepared `cluster` type with a removable `compute` identity whose
    /// commands run `body`.
    fn fixture(body: &str) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let types = root.path().join("types");
        let dir = write_type(&types, "cluster", "cluster", "Cluster", QUESTIONS);
        std::fs::write(dir.join("state.yaml"), "prepared: true\n").unwrap();
        std::fs::create_dir_all(dir.join("identities")).unwrap();
        script(&dir, "job.sh", body);
        std::fs::write(
            dir.join("identities/compute.yaml"),
            "name: compute\ncommands:\n  apply: job.sh\n  remove: job.sh\nremovable: true\nenv:\n  CLUSTER: from-identity\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("identities/login.yaml"),
            "name: login\ncommands:\n  apply: job.sh\n",
        )
        .unwrap();

        let mut settings = Settings::rooted(&root.path().join("state"));
        settings.type_paths = vec![types.clone()];
        settings.hunter.enabled = true;
        settings.hunter.remove_entry = true;

        let cluster_type = TypeRegistry::discover(&settings.type_paths)
            .unwrap()
            .require("cluster")
            .unwrap()
            .clone();
        let registry = Arc::new(NodeRegistry::new(settings.nodes_file()));
        Fixture {
            _root: root,
            settings,
            cluster_type,
            registry,
            hunter: Arc::new(RecordingHunter::default()),
            signaller: Arc::new(RecordingSignaller::default()),
        }
    }

    impl Fixture {
        fn orchestrator(&self) -> JobOrchestrator {
            JobOrchestrator::new(self.settings.clone(), self.registry.clone())
                .with_hunter(self.hunter.clone())
                .with_guard(RecoveryGuard::new(self.signaller.clone()))
        }

        fn seed(&self, name: &str, identity: &str, status: NodeStatus, pid: Option<u32>) {
            let mut node = Node::new(name, name).with_identity(identity);
            node.status = status;
            node.deployment_pid = pid;
            self.registry.insert(node).unwrap();
        }
    }

    fn answers() -> Answers {
        Answers::from([("cluster_name".to_string(), "c1".to_string())])
    }

    fn remove(targets: &str, wait: bool, force: bool) -> DeployRequest {
        DeployRequest {
            action: Action::Remove,
            targets: targets.to_string(),
            wait,
            force,
            remove_hunter_entry: false,
        }
    }

    #[tokio::test]
    async fn successful_removal_deletes_group_and_notifies_hunter_once() {
        let fx = fixture("echo removing $NODE");
        for name in ["n1", "n2", "n3"] {
            fx.seed(name, "compute", NodeStatus::Complete, None);
        }

        let outcome = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n[1-3]", true, false))
            .await
            .unwrap();

        assert_eq!(outcome.partitions.len(), 1);
        assert_eq!(outcome.partitions[0].exit_code, Some(0));
        assert!(outcome.succeeded());
        assert!(fx.registry.all(|_| true).unwrap().is_empty());
        assert_eq!(*fx.hunter.calls.lock().unwrap(), vec!["n1,n2,n3"]);

        let log = std::fs::read_to_string(fx.settings.log_dir.join("remove/n2")).unwrap();
        assert_eq!(log.trim(), "removing n1,n2,n3");
    }

    #[tokio::test]
    async fn failed_removal_keeps_nodes_with_exit_status() {
        let fx = fixture("exit 3");
        fx.seed("n1", "compute", NodeStatus::Complete, None);
        fx.seed("n2", "compute", NodeStatus::Complete, None);

        let outcome = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1,n2", true, false))
            .await
            .unwrap();

        assert_eq!(outcome.partitions[0].exit_code, Some(3));
        assert!(!outcome.succeeded());
        for name in ["n1", "n2"] {
            let node = fx.registry.find(name).unwrap().unwrap();
            assert_eq!(node.status, NodeStatus::Failed);
            assert_eq!(node.exit_status, Some(3));
            assert_eq!(node.deployment_pid, None);
            assert_eq!(node.last_action, None);
        }
        assert!(fx.hunter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hunter_is_left_alone_unless_entry_removal_is_enabled() {
        let mut fx = fixture("true");
        fx.settings.hunter.remove_entry = false;
        fx.seed("n1", "compute", NodeStatus::Complete, None);

        fx.orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1", true, false))
            .await
            .unwrap();
        assert!(fx.hunter.calls.lock().unwrap().is_empty());

        fx.seed("n2", "compute", NodeStatus::Complete, None);
        let mut request = remove("n2", true, false);
        request.remove_hunter_entry = true;
        fx.orchestrator()
            .deploy(&fx.cluster_type, &answers(), &request)
            .await
            .unwrap();
        assert_eq!(*fx.hunter.calls.lock().unwrap(), vec!["n2"]);
    }

    #[tokio::test]
    async fn busy_node_blocks_dispatch_unless_forced() {
        let fx = fixture("true");
        fx.seed("n1", "compute", NodeStatus::InProgress, Some(4321));
        fx.seed("n2", "compute", NodeStatus::Complete, None);

        let err = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1,n2", true, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(ref names) if names == &["n1"]));
        assert!(fx.signaller.pids.lock().unwrap().is_empty());
        let n1 = fx.registry.find("n1").unwrap().unwrap();
        assert_eq!(n1.deployment_pid, Some(4321));

        fx.orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1,n2", true, true))
            .await
            .unwrap();
        assert_eq!(*fx.signaller.pids.lock().unwrap(), vec![4321]);
        assert!(fx.registry.all(|_| true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_preconditions_batch_offenders() {
        let fx = fixture("true");
        fx.seed("n1", "login", NodeStatus::Complete, None);
        fx.seed("n2", "login", NodeStatus::Complete, None);
        fx.registry.insert(Node::new("bare", "bare")).unwrap();

        let err = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1,ghost,bare", true, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodesNotFound(ref names) if names == &["ghost", "bare"]));

        let err = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n[1-2]", true, false))
            .await
            .unwrap_err();
        match err {
            Error::UnsupportedAction { action, nodes } => {
                assert_eq!(action, "remove");
                assert_eq!(nodes, vec!["n1", "n2"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_answers_dispatch_nothing() {
        let fx = fixture("true");
        fx.seed("n1", "compute", NodeStatus::Complete, None);

        let err = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &Answers::new(), &remove("n1", true, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingAnswers(ref keys) if keys == &["cluster name"]));
        let n1 = fx.registry.find("n1").unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::Complete);
        assert!(!fx.settings.log_dir.join("remove").exists());
    }

    #[tokio::test]
    async fn unprepared_type_is_refused() {
        let fx = fixture("true");
        std::fs::write(fx.cluster_type.base_path.join("state.yaml"), "prepared: false\n").unwrap();
        let unprepared = TypeRegistry::discover(&fx.settings.type_paths)
            .unwrap()
            .require("cluster")
            .unwrap()
            .clone();
        let err = fx
            .orchestrator()
            .deploy(&unprepared, &answers(), &remove("n1", true, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPrepared(ref id) if id == "cluster"));
    }

    #[tokio::test]
    async fn apply_creates_records_and_merges_environment() {
        let fx = fixture("echo \"$NODE|$CLUSTER|$HUNTER_HOSTS|$ANSIBLE_STDOUT_CALLBACK|$(basename $INVFILE)|$(basename $RUN_ENV)\"");
        let request = DeployRequest {
            action: Action::Apply {
                identity: "compute".to_string(),
            },
            targets: "gpu[1-2]".to_string(),
            wait: true,
            force: false,
            remove_hunter_entry: false,
        };

        let outcome = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &request)
            .await
            .unwrap();
        assert_eq!(outcome.partitions[0].identity, "compute");
        assert_eq!(outcome.partitions[0].nodes, vec!["gpu1", "gpu2"]);

        let nodes = fx.registry.all(|_| true).unwrap();
        assert_eq!(nodes.len(), 2);
        for node in &nodes {
            assert_eq!(node.identity.as_deref(), Some("compute"));
            assert_eq!(node.status, NodeStatus::Complete);
            assert_eq!(node.exit_status, Some(0));
        }

        let log = std::fs::read_to_string(fx.settings.log_dir.join("apply/gpu1")).unwrap();
        assert_eq!(
            log.trim(),
            "gpu1,gpu2|from-identity|true|log_plays_v2|c1.yaml|run_env"
        );
    }

    #[tokio::test]
    async fn apply_rejects_unknown_identity() {
        let fx = fixture("true");
        let request = DeployRequest {
            action: Action::Apply {
                identity: "storage".to_string(),
            },
            targets: "n1".to_string(),
            wait: true,
            force: false,
            remove_hunter_entry: false,
        };
        let err = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownIdentity { ref identity, .. } if identity == "storage"));
        assert!(fx.registry.all(|_| true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_are_truncated_and_linked() {
        let fx = fixture("echo fresh");
        fx.seed("n1", "compute", NodeStatus::Complete, None);
        let remove_dir = fx.settings.log_dir.join("remove");
        std::fs::create_dir_all(&remove_dir).unwrap();
        std::fs::write(remove_dir.join("n1"), "stale output\n").unwrap();

        fx.orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1", true, false))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(remove_dir.join("n1")).unwrap(), "fresh\n");
        let links: Vec<PathBuf> = std::fs::read_dir(&fx.settings.log_dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_symlink())
            .collect();
        assert_eq!(links.len(), 1);
        let name = links[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("n1-remove-") && name.ends_with(".log"), "{name}");
        assert_eq!(std::fs::read_link(&links[0]).unwrap(), remove_dir.join("n1"));
    }

    #[derive(Default)]
    struct RecordingLauncher {
        specs: Mutex<Vec<JobSpec>>,
    }

    impl DetachedLauncher for RecordingLauncher {
        fn launch(&self, spec: &JobSpec) -> Result<u32> {
            self.specs.lock().unwrap().push(spec.clone());
            Ok(99_999)
        }
    }

    #[tokio::test]
    async fn detached_records_supervisor_pid() {
        let fx = fixture("true");
        fx.seed("n1", "compute", NodeStatus::Complete, None);
        let launcher = Arc::new(RecordingLauncher::default());

        let outcome = fx
            .orchestrator()
            .with_launcher(launcher.clone())
            .deploy(&fx.cluster_type, &answers(), &remove("n1", false, false))
            .await
            .unwrap();

        assert_eq!(outcome.partitions[0].pid, Some(99_999));
        assert_eq!(outcome.partitions[0].exit_code, None);
        let n1 = fx.registry.find("n1").unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::InProgress);
        assert_eq!(n1.deployment_pid, Some(99_999));
        assert_eq!(n1.last_action.as_deref(), Some("remove"));

        let specs = launcher.specs.lock().unwrap();
        assert_eq!(specs[0].nodes, vec!["n1"]);
        assert_eq!(specs[0].hunter_command.as_deref(), Some("hunter"));
        assert_eq!(specs[0].env["NODE"], "n1");
    }

    #[tokio::test]
    async fn supervised_job_completes_from_its_spec() {
        let fx = fixture("exit 0");
        fx.seed("n1", "compute", NodeStatus::Complete, None);
        let launcher = Arc::new(RecordingLauncher::default());
        fx.orchestrator()
            .with_launcher(launcher.clone())
            .deploy(&fx.cluster_type, &answers(), &remove("n1", false, false))
            .await
            .unwrap();

        let mut spec = launcher.specs.lock().unwrap()[0].clone();
        spec.hunter_command = None;
        let path = fx.settings.jobs_dir().join("job.yaml");
        std::fs::create_dir_all(fx.settings.jobs_dir()).unwrap();
        std::fs::write(&path, serde_yaml::to_string(&spec).unwrap()).unwrap();

        // the supervisor runs in this process here
        let mut n1 = fx.registry.find("n1").unwrap().unwrap();
        n1.deployment_pid = Some(std::process::id());
        fx.registry.insert(n1).unwrap();

        let loaded = JobSpec::load(&path).unwrap();
        assert_eq!(loaded, spec);
        assert_eq!(supervise(&loaded).await.unwrap(), 0);
        assert!(fx.registry.find("n1").unwrap().is_none());
    }

    #[tokio::test]
    async fn supervisor_records_a_job_that_cannot_start() {
        let fx = fixture("exit 0");
        fx.seed("n1", "compute", NodeStatus::Complete, None);
        let launcher = Arc::new(RecordingLauncher::default());
        fx.orchestrator()
            .with_launcher(launcher.clone())
            .deploy(&fx.cluster_type, &answers(), &remove("n1", false, false))
            .await
            .unwrap();

        let mut spec = launcher.specs.lock().unwrap()[0].clone();
        spec.program = fx.cluster_type.base_path.join("missing.sh");
        let mut n1 = fx.registry.find("n1").unwrap().unwrap();
        n1.deployment_pid = Some(std::process::id());
        fx.registry.insert(n1).unwrap();

        assert_eq!(supervise(&spec).await.unwrap(), process::SPAWN_FAILED);
        let n1 = fx.registry.find("n1").unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::Failed);
        assert_eq!(n1.exit_status, Some(process::SPAWN_FAILED));
        assert_eq!(n1.deployment_pid, None);
    }

    #[tokio::test]
    async fn unstartable_partition_fails_alone() {
        let fx = fixture("echo removing $NODE");
        std::fs::write(
            fx.cluster_type.base_path.join("identities/broken.yaml"),
            "name: broken\ncommands:\n  remove: missing.sh\nremovable: true\n",
        )
        .unwrap();
        fx.seed("n1", "compute", NodeStatus::Complete, None);
        fx.seed("n2", "broken", NodeStatus::Complete, None);

        let outcome = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &answers(), &remove("n1,n2", true, false))
            .await
            .unwrap();

        assert_eq!(outcome.partitions.len(), 2);
        let compute = &outcome.partitions[0];
        assert_eq!(compute.identity, "compute");
        assert_eq!(compute.exit_code, Some(0));
        assert!(compute.pid.is_some());
        let broken = &outcome.partitions[1];
        assert_eq!(broken.identity, "broken");
        assert_eq!(broken.pid, None);
        assert_eq!(broken.exit_code, Some(process::SPAWN_FAILED));
        assert!(!outcome.succeeded());

        assert!(fx.registry.find("n1").unwrap().is_none());
        let n2 = fx.registry.find("n2").unwrap().unwrap();
        assert_eq!(n2.status, NodeStatus::Failed);
        assert_eq!(n2.exit_status, Some(process::SPAWN_FAILED));
        assert_eq!(n2.deployment_pid, None);
        assert_eq!(*fx.hunter.calls.lock().unwrap(), vec!["n1"]);
    }

    struct FailingLauncher;

    impl DetachedLauncher for FailingLauncher {
        fn launch(&self, _spec: &JobSpec) -> Result<u32> {
            Err(Error::io(
                "spawning supervisor",
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ))
        }
    }

    #[tokio::test]
    async fn failed_supervisor_launch_is_recorded() {
        let fx = fixture("true");
        fx.seed("n1", "compute", NodeStatus::Complete, None);

        let outcome = fx
            .orchestrator()
            .with_launcher(Arc::new(FailingLauncher))
            .deploy(&fx.cluster_type, &answers(), &remove("n1", false, false))
            .await
            .unwrap();

        assert_eq!(outcome.partitions[0].pid, None);
        assert_eq!(outcome.partitions[0].exit_code, Some(process::SPAWN_FAILED));
        let n1 = fx.registry.find("n1").unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::Failed);
        assert_eq!(n1.exit_status, Some(process::SPAWN_FAILED));
        assert_eq!(n1.deployment_pid, None);
        assert_eq!(n1.last_action, None);
    }

    #[tokio::test]
    async fn late_completion_leaves_redispatched_nodes_alone() {
        let fx = fixture("true");
        fx.seed("n1", "compute", NodeStatus::InProgress, Some(222));
        fx.seed("n2", "compute", NodeStatus::InProgress, Some(111));
        let spec = JobSpec {
            action: "remove".to_string(),
            program: PathBuf::from("/bin/true"),
            env: BTreeMap::new(),
            log_files: Vec::new(),
            nodes: vec!["n1".to_string(), "n2".to_string()],
            registry: fx.registry.path().to_path_buf(),
            hunter_command: Some("hunter".to_string()),
            working_dir: None,
            log_dir: fx.settings.log_dir.clone(),
            log_level: "info".to_string(),
        };

        let hunter: &dyn HunterNotifier = fx.hunter.as_ref();
        complete(&fx.registry, &spec, 111, 129, Some(hunter)).await.unwrap();
        let n1 = fx.registry.find("n1").unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::InProgress);
        assert_eq!(n1.deployment_pid, Some(222));
        let n2 = fx.registry.find("n2").unwrap().unwrap();
        assert_eq!(n2.status, NodeStatus::Failed);
        assert_eq!(n2.exit_status, Some(129));

        fx.seed("n2", "compute", NodeStatus::InProgress, Some(111));
        let hunter: &dyn HunterNotifier = fx.hunter.as_ref();
        complete(&fx.registry, &spec, 111, 0, Some(hunter)).await.unwrap();
        assert!(fx.registry.find("n1").unwrap().is_some());
        assert!(fx.registry.find("n2").unwrap().is_none());
        assert_eq!(*fx.hunter.calls.lock().unwrap(), vec!["n2"]);
    }

    #[tokio::test]
    async fn busy_is_reported_before_missing_answers() {
        let fx = fixture("true");
        fx.seed("n1", "compute", NodeStatus::InProgress, Some(4321));

        let err = fx
            .orchestrator()
            .deploy(&fx.cluster_type, &Answers::new(), &remove("n1", true, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(ref names) if names == &["n1"]));
        assert!(fx.signaller.pids.lock().unwrap().is_empty());
    }
}
