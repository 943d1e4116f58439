//! Process configuration, read from `TASKD_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::backends::{
    Backend, BackendInfo, BackendRouter, CostTier, DEFAULT_BACKEND_TIMEOUT, DelegatedBackend,
    ResearchBackend, ToolSessionBackend,
};
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, create_provider};
use crate::session::{Committer, DEFAULT_MAX_TURNS, GitCommitter, SessionConfig, ToolSession};
use crate::tasks::ClaimFilter;
use crate::worker::{RoutingOptions, WorkerConfig};

const PREFIX: &str = "TASKD_";

/// Backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    ToolSession,
    Research,
    Gateway,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tool_session" | "session" => Ok(Self::ToolSession),
            "research" => Ok(Self::Research),
            "gateway" | "delegated" => Ok(Self::Gateway),
            other => Err(format!("unknown backend kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub provider: LlmBackend,
    pub model: Option<String>,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub tier: CostTier,
    pub reliability: u32,
    pub timeout: Duration,
}

impl BackendConfig {
    fn info(&self) -> BackendInfo {
        BackendInfo::new(&self.name)
            .with_tier(self.tier)
            .with_reliability(self.reliability)
            .with_timeout(self.timeout)
    }

    fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::MissingEnvVar(backend_key(&self.name, "API_KEY")))?;
        Ok(LlmConfig {
            backend: self.provider,
            api_key,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_token: Option<SecretString>,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub stale_after: Option<Duration>,
    pub task_timeout: Option<Duration>,
    pub prefer_free: bool,
    pub max_turns: u32,
    pub command_timeout: Duration,
    pub workdir: PathBuf,
    pub bind: String,
    pub log_dir: Option<PathBuf>,
    /// Declared order is fallback order.
    pub backends: Vec<BackendConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; tests pass a map instead of the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = WorkerConfig::default();

        // Checked when the router is built; `enqueue` needs no backends.
        let names: Vec<String> = env
            .get("BACKENDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut backends = Vec::with_capacity(names.len());
        for name in names {
            if backends.iter().any(|b: &BackendConfig| b.name == name) {
                return Err(ConfigError::InvalidValue {
                    key: format!("{PREFIX}BACKENDS"),
                    message: format!("backend '{name}' declared twice"),
                });
            }
            backends.push(env.backend(name)?);
        }

        let concurrency: usize = env.parse("CONCURRENCY", 3)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}CONCURRENCY"),
                message: "must be at least 1".to_string(),
            });
        }

        let stale_secs: u64 = env.parse("STALE_AFTER_SECS", 2 * 60 * 60)?;

        Ok(Self {
            database_url: env
                .get("DATABASE_URL")
                .unwrap_or_else(|| "./data/ai-taskd.db".to_string()),
            database_token: env.get("DATABASE_TOKEN").map(SecretString::from),
            worker_id: env.get("WORKER_ID").unwrap_or(defaults.worker_id),
            poll_interval: env.secs("POLL_INTERVAL_SECS", 30)?,
            concurrency,
            heartbeat_interval: env.secs("HEARTBEAT_INTERVAL_SECS", 300)?,
            backoff_base: env.secs("BACKOFF_BASE_SECS", 5)?,
            backoff_cap: env.secs("BACKOFF_CAP_SECS", 300)?,
            stale_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
            task_timeout: env
                .get("TASK_TIMEOUT_SECS")
                .map(|v| parse_value(&format!("{PREFIX}TASK_TIMEOUT_SECS"), &v))
                .transpose()?
                .map(Duration::from_secs),
            prefer_free: env.flag("PREFER_FREE")?,
            max_turns: env.parse("MAX_TURNS", DEFAULT_MAX_TURNS)?,
            command_timeout: env.secs("COMMAND_TIMEOUT_SECS", 30)?,
            workdir: env.get("WORKDIR").map(PathBuf::from).unwrap_or_else(|| ".".into()),
            bind: env.get("BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            log_dir: env.get("LOG_DIR").map(PathBuf::from),
            backends,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id.clone(),
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            stale_after: self.stale_after,
            claim_filter: ClaimFilter::any(),
        }
    }

    pub fn routing_options(&self) -> RoutingOptions {
        RoutingOptions {
            backend: None,
            timeout: self.task_timeout,
            prefer_free: self.prefer_free,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(&self.workdir)
            .with_max_turns(self.max_turns)
            .with_command_timeout(self.command_timeout)
    }

    /// Instantiate every declared backend. Tool sessions share one committer
    /// so commits on the working tree are serialized.
    pub fn build_router(&self) -> Result<BackendRouter, ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::MissingEnvVar(format!("{PREFIX}BACKENDS")));
        }
        let committer: Arc<dyn Committer> = Arc::new(GitCommitter::new(&self.workdir));
        let mut built: Vec<Arc<dyn Backend>> = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            let llm_error = |e: crate::error::LlmError| ConfigError::InvalidValue {
                key: backend_key(&backend.name, "PROVIDER"),
                message: e.to_string(),
            };
            let instance: Arc<dyn Backend> = match backend.kind {
                BackendKind::ToolSession => {
                    let llm = create_provider(&backend.llm_config()?).map_err(llm_error)?;
                    let session = ToolSession::new(llm, committer.clone(), self.session_config());
                    Arc::new(ToolSessionBackend::new(backend.info(), session))
                }
                BackendKind::Research => {
                    let llm = create_provider(&backend.llm_config()?).map_err(llm_error)?;
                    Arc::new(ResearchBackend::new(backend.info(), llm))
                }
                BackendKind::Gateway => {
                    let url = backend.base_url.clone().ok_or_else(|| {
                        ConfigError::MissingEnvVar(backend_key(&backend.name, "BASE_URL"))
                    })?;
                    let mut delegated = DelegatedBackend::new(backend.info(), url);
                    if let Some(key) = backend.api_key.clone() {
                        delegated = delegated.with_api_key(key);
                    }
                    Arc::new(delegated)
                }
            };
            tracing::info!(
                backend = %backend.name,
                kind = ?backend.kind,
                tier = ?backend.tier,
                reliability = backend.reliability,
                "Backend configured"
            );
            built.push(instance);
        }

        BackendRouter::new(built).map_err(|e| ConfigError::InvalidValue {
            key: format!("{PREFIX}BACKENDS"),
            message: e.to_string(),
        })
    }
}

fn backend_key(name: &str, field: &str) -> String {
    format!(
        "{PREFIX}BACKEND_{}_{field}",
        name.to_ascii_uppercase().replace(['-', '.', ' '], "_")
    )
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn get(&self, suffix: &str) -> Option<String> {
        self.raw(&format!("{PREFIX}{suffix}"))
    }

    fn parse<T: FromStr>(&self, suffix: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(suffix) {
            Some(v) => parse_value(&format!("{PREFIX}{suffix}"), &v),
            None => Ok(default),
        }
    }

    fn secs(&self, suffix: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(suffix, default).map(Duration::from_secs)
    }

    fn flag(&self, suffix: &str) -> Result<bool, ConfigError> {
        match self.get(suffix).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}{suffix}"),
                message: format!("'{v}' is not a boolean"),
            }),
        }
    }

    /// Parse a per-backend field whose type reports errors as `String`.
    fn backend_field<T: FromStr<Err = String>>(
        &self,
        name: &str,
        field: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        let key = backend_key(name, field);
        match self.raw(&key) {
            Some(raw) => raw
                .parse()
                .map_err(|message| ConfigError::InvalidValue { key, message }),
            None => Ok(default),
        }
    }

    fn backend(&self, name: String) -> Result<BackendConfig, ConfigError> {
        let field = |f: &str| self.raw(&backend_key(&name, f));

        let reliability = match field("RELIABILITY") {
            Some(raw) => parse_value(&backend_key(&name, "RELIABILITY"), &raw)?,
            None => 1,
        };
        let timeout = match field("TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_value(&backend_key(&name, "TIMEOUT_SECS"), &raw)?),
            None => DEFAULT_BACKEND_TIMEOUT,
        };

        Ok(BackendConfig {
            kind: self.backend_field(&name, "KIND", BackendKind::ToolSession)?,
            provider: self.backend_field(&name, "PROVIDER", LlmBackend::Anthropic)?,
            model: field("MODEL"),
            api_key: field("API_KEY").map(SecretString::from),
            base_url: field("BASE_URL"),
            tier: self.backend_field(&name, "TIER", CostTier::Paid)?,
            reliability,
            timeout,
            name,
        })
    }
}
