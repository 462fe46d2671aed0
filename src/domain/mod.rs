pub mod answer_tree;
pub mod cluster_type;
pub mod log_view;
pub mod node;
pub mod node_registry;
pub mod orchestrator;
pub mod prefill;
pub mod question;
pub mod recovery;
