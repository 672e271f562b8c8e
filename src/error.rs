use std::process::ExitStatus;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("command failed: {command}")]
    CommandFailed { command: String, status: ExitStatus },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("SSH connection failed: {0}")]
    SshFailed(String),

    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    #[error("must run as root on {0}")]
    NotRoot(String),

    #[error("dependency manifest not found: {0}")]
    ManifestMissing(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("another hoist run holds the lock: {0}")]
    Locked(String),

    #[error(
        "{domain} resolves to [{}], not this host ({public})",
        .resolved.join(", ")
    )]
    DnsMismatch {
        domain: String,
        resolved: Vec<String>,
        public: String,
    },

    #[error("health check failed for {url}: {reason}")]
    HealthcheckFailed { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("step '{step}' failed")]
    StepFailed {
        step: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl DeployError {
    /// The innermost error, looking through step wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the pipeline step that failed, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}
