//! Error taxonomy for the deployment core.
//!
//! Every user-facing variant carries the complete list of offending
//! identifiers so a caller sees every problem at once.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // ── Validation ─────────────────────────────────────────

    #[error("{}", mismatch_message(.missing, .extra))]
    AnswerMismatch {
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("The following answers did not pass validation: {}", .0.join(", "))]
    InvalidAnswers(Vec<String>),

    #[error(
        "The following config keys have not been set:\n{}\nPlease run `stoke configure`",
        .0.join("\n")
    )]
    MissingAnswers(Vec<String>),

    // ── Preconditions ──────────────────────────────────────

    #[error(
        "The following nodes either do not exist or do not have an identity applied to them:\n{}",
        .0.join("\n")
    )]
    NodesNotFound(Vec<String>),

    #[error(
        "The following nodes have an identity that doesn't currently support the `{action}` command:\n{}",
        .nodes.join("\n")
    )]
    UnsupportedAction { action: String, nodes: Vec<String> },

    #[error("Identity '{identity}' does not exist for cluster type '{cluster_type}'")]
    UnknownIdentity {
        identity: String,
        cluster_type: String,
    },

    #[error("Unknown cluster type: {0}")]
    UnknownClusterType(String),

    #[error("Cluster has not yet been configured - please run `stoke configure`")]
    NotConfigured,

    #[error("Cluster type has not been prepared yet. Please run `stoke prepare {0}`.")]
    NotPrepared(String),

    #[error("No script found for preparing the {name} cluster type at {}", .path.display())]
    MissingPrepareScript { name: String, path: PathBuf },

    #[error("Invalid host range '{expression}': {reason}")]
    InvalidHostRange { expression: String, reason: String },

    // ── Conflicts ──────────────────────────────────────────

    #[error(
        "The following nodes are either in a failed process state\nor are currently undergoing a remove/apply process:\n{}",
        .0.join("\n")
    )]
    Busy(Vec<String>),

    #[error(
        "Duplicate types exist across type paths; please remove all duplicate instances of: {}",
        .0.join(", ")
    )]
    DuplicateClusterTypes(Vec<String>),

    // ── Plumbing ───────────────────────────────────────────

    #[error("checksum verification failed for {}", .0.display())]
    ChecksumMismatch(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Config(#[from] Box<figment::Error>),

    #[error("prompt failed: {0}")]
    Prompt(String),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

fn mismatch_message(missing: &[String], extra: &[String]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!(
            "The following questions were not answered: {}",
            missing.join(", ")
        ));
    }
    if !extra.is_empty() {
        parts.push(format!(
            "The following given answers are not recognised by the cluster type: {}",
            extra.join(", ")
        ));
    }
    parts.join("\n")
}

/// Extension for attaching path context to io errors, in the spirit of
/// `anyhow::Context`.
pub trait IoContext<T> {
    fn with_path(self, what: &str, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, what: &str, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::io(format!("{what} {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_reports_both_lists() {
        let err = Error::AnswerMismatch {
            missing: vec!["b".into()],
            extra: vec!["c".into(), "d".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("not answered: b"));
        assert!(msg.contains("not recognised by the cluster type: c, d"));
    }

    #[test]
    fn busy_names_every_node() {
        let msg = Error::Busy(vec!["n1".into(), "n2".into()]).to_string();
        assert!(msg.ends_with("n1\nn2"));
    }
}
