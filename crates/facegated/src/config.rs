use facegate_core::{Backend, EmbeddingProfile, Metric, PipelineOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file read when `FACEGATE_CONFIG` is unset and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/facegate/config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("invalid matching profile: {0}")]
    Profile(#[from] facegate_core::profile::ProfileError),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Optional on-disk settings. Every key may be overridden by a `FACEGATE_*`
/// environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub backend: Option<String>,
    pub metric: Option<String>,
    pub threshold: Option<f32>,
    pub detector_confidence: Option<f32>,
    pub refresh_on_verify: Option<bool>,
    pub return_embedding: Option<bool>,
    pub request_timeout_secs: Option<u64>,
    pub bus: Option<BusKind>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Daemon configuration. Read once at startup, immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite identity registry.
    pub db_path: PathBuf,
    /// Backend, metric and threshold as one validated unit.
    pub profile: EmbeddingProfile,
    /// Minimum SCRFD score for a detection to count as a face.
    pub detector_confidence: f32,
    pub pipeline: PipelineOptions,
    /// Include the embedding in successful enroll/verify replies.
    pub return_embedding: bool,
    /// Upper bound on one enroll or verify request.
    pub request_timeout_secs: u64,
    pub bus: BusKind,
}

impl Config {
    /// Resolve configuration: environment over config file over defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Some(ConfigFile::load(Path::new(&path))?),
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Some(ConfigFile::load(Path::new(DEFAULT_CONFIG_PATH))?)
            }
            Err(_) => None,
        };
        if file.is_some() {
            tracing::info!("configuration file loaded");
        }
        Self::resolve(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Merge `file` with variables from `env`.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let model_dir = env("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(facegate_core::default_model_dir);

        let db_path = env("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("identities.db"));

        let backend: Backend =
            parse_key("FACEGATE_BACKEND", env("FACEGATE_BACKEND").or(file.backend))?
                .unwrap_or(Backend::CanonicalCrop);
        let metric: Metric =
            parse_key("FACEGATE_METRIC", env("FACEGATE_METRIC").or(file.metric))?
                .unwrap_or(Metric::Euclidean);
        let threshold = parse_key("FACEGATE_THRESHOLD", env("FACEGATE_THRESHOLD"))?
            .or(file.threshold)
            .unwrap_or_else(|| EmbeddingProfile::default_threshold(backend, metric));
        let profile = EmbeddingProfile::new(backend, metric, threshold)?;

        let detector_confidence =
            parse_key("FACEGATE_DETECTOR_CONFIDENCE", env("FACEGATE_DETECTOR_CONFIDENCE"))?
                .or(file.detector_confidence)
                .unwrap_or(facegate_core::detector::SCRFD_DEFAULT_CONFIDENCE);
        if !(0.0..1.0).contains(&detector_confidence) {
            return Err(ConfigError::Invalid {
                key: "detector_confidence",
                message: format!("{detector_confidence} is outside [0, 1)"),
            });
        }

        let refresh_on_verify = env_bool(&env, "FACEGATE_REFRESH_ON_VERIFY")
            .or(file.refresh_on_verify)
            .unwrap_or(false);
        let return_embedding = env_bool(&env, "FACEGATE_RETURN_EMBEDDING")
            .or(file.return_embedding)
            .unwrap_or(false);

        let request_timeout_secs =
            parse_key("FACEGATE_REQUEST_TIMEOUT_SECS", env("FACEGATE_REQUEST_TIMEOUT_SECS"))?
                .or(file.request_timeout_secs)
                .unwrap_or(10)
                .max(1);

        let bus = match env("FACEGATE_BUS").as_deref() {
            Some("session") => BusKind::Session,
            Some("system") => BusKind::System,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "FACEGATE_BUS",
                    message: format!("{other:?} (expected \"system\" or \"session\")"),
                })
            }
            None => file.bus.unwrap_or(BusKind::System),
        };

        Ok(Self {
            model_dir,
            db_path,
            profile,
            detector_confidence,
            pipeline: PipelineOptions { refresh_on_verify },
            return_embedding,
            request_timeout_secs,
            bus,
        })
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(facegate_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the embedding model of the configured backend.
    pub fn embedding_model_path(&self) -> String {
        self.model_dir
            .join(facegate_core::model_file(self.profile.backend()))
            .to_string_lossy()
            .into_owned()
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

fn parse_key<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                message: format!("{v:?}: {e}"),
            })
        })
        .transpose()
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env(key).map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off" | ""))
}
