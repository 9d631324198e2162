use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error(
        "Working tree has {} uncommitted change(s): {}",
        dirty_files.len(),
        dirty_files.join(", ")
    )]
    Precondition { dirty_files: Vec<String> },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Usage quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Agent binary not found: {0}")]
    AgentBinaryNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Workspace branch already exists: {0}")]
    WorkspaceExists(String),

    #[error("Branch {0} is still checked out in a workspace")]
    WorkspaceCheckedOut(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Repository {repo} is leased by batch {batch_id}")]
    LeaseHeld { repo: String, batch_id: String },

    #[error("Plan job {0} was already approved for execution")]
    PlanLocked(String),

    #[error("Plan job not found: {0}")]
    PlanJobNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),
}

impl Error {
    /// Whether a failed attempt may be redispatched.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::QuotaExhausted(_) | Error::AgentBinaryNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
