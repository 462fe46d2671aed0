use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    /// Set while a job owns this node.
    #[serde(default)]
    pub deployment_pid: Option<u32>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub last_action: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Complete,
    Failed,
    InProgress,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::InProgress => "in_progress",
        }
    }

    pub fn from_exit(code: i32) -> Self {
        if code == 0 {
            Self::Complete
        } else {
            Self::Failed
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Node {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            identity: None,
            status: NodeStatus::Idle,
            deployment_pid: None,
            exit_status: None,
            last_action: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Anything short of a completed deployment blocks new work.
    pub fn is_busy(&self) -> bool {
        self.status != NodeStatus::Complete
    }

    pub fn apply(&mut self, update: &NodeUpdate) {
        if let Some(identity) = &update.identity {
            self.identity = identity.clone();
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(pid) = update.deployment_pid {
            self.deployment_pid = pid;
        }
        if let Some(code) = update.exit_status {
            self.exit_status = code;
        }
        if let Some(action) = &update.last_action {
            self.last_action = action.clone();
        }
    }
}

/// Field changes applied to a node. `None` leaves a field untouched; the
/// inner option of the nullable fields sets or clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    pub identity: Option<Option<String>>,
    pub status: Option<NodeStatus>,
    pub deployment_pid: Option<Option<u32>>,
    pub exit_status: Option<Option<i32>>,
    pub last_action: Option<Option<String>>,
}

impl NodeUpdate {
    /// A job has taken ownership of the node.
    pub fn dispatched(pid: u32, action: &str) -> Self {
        Self {
            status: Some(NodeStatus::InProgress),
            deployment_pid: Some(Some(pid)),
            last_action: Some(Some(action.to_string())),
            ..Default::default()
        }
    }

    /// The owning job exited with `code`.
    pub fn finished(code: i32) -> Self {
        Self {
            status: Some(NodeStatus::from_exit(code)),
            deployment_pid: Some(None),
            exit_status: Some(Some(code)),
            last_action: Some(None),
            ..Default::default()
        }
    }
}
