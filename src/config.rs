use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which embedding backend indexes the catalog and embeds queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    /// Feature-hashing embedder. No model files, fully deterministic.
    Hash,
    /// ONNX bi-encoder loaded from `BI_ENCODER_MODEL_PATH`.
    Onnx,
}

impl EmbedderKind {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.to_lowercase().as_str() {
            "hash" | "hashing" | "lexical" => Ok(Self::Hash),
            "onnx" | "bi-encoder" | "bi_encoder" => Ok(Self::Onnx),
            other => anyhow::bail!("Unknown EMBEDDER '{}', expected 'hash' or 'onnx'", other),
        }
    }
}

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

pub struct Config {
    pub host: String,
    pub port: u16,
    /// Tool catalog document (process name -> command, args, tools).
    pub catalog_path: PathBuf,
    pub embedder: EmbedderKind,
    /// Vector width of the hashing embedder. Ignored by the bi-encoder.
    pub embedding_dim: usize,
    pub bi_encoder_model_path: PathBuf,
    pub bi_encoder_tokenizer_path: PathBuf,
    pub max_sequence_length: usize,
    /// Optional override for bi-encoder session count. If None, uses available parallelism.
    pub pool_size: Option<usize>,
    /// Texts per embedding batch while indexing the catalog.
    pub batch_size: usize,
    /// Optional on-disk cache of catalog embeddings.
    pub embeddings_cache_path: Option<PathBuf>,
    /// Default threshold for interactive discovery.
    pub discover_threshold: f32,
    /// Threshold for auto-executing the top match. Stricter than discovery.
    pub execute_threshold: f32,
    pub default_top_k: usize,
    /// Optional deadline for a single backend call. A call that overruns
    /// it tears the connection down.
    pub call_timeout: Option<Duration>,
    /// How long a child gets to exit after SIGTERM before it is killed.
    pub terminate_grace: Duration,
    pub validate_arguments: bool,
    pub shutdown_timeout_secs: u64,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let execute_threshold: f32 = env::var("EXECUTE_THRESHOLD")
            .unwrap_or_else(|_| "0.6".to_string())
            .parse()?;
        let discover_threshold: f32 = env::var("DISCOVER_THRESHOLD")
            .unwrap_or_else(|_| "0.5".to_string())
            .parse()?;

        if execute_threshold < discover_threshold {
            tracing::warn!(
                execute_threshold,
                discover_threshold,
                "EXECUTE_THRESHOLD is below DISCOVER_THRESHOLD; auto-execution will be laxer than discovery"
            );
        }

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            catalog_path: PathBuf::from(
                env::var("CATALOG_PATH").unwrap_or_else(|_| "./config/registry.json".to_string()),
            ),
            embedder: EmbedderKind::parse(
                &env::var("EMBEDDER").unwrap_or_else(|_| "hash".to_string()),
            )?,
            embedding_dim: env::var("EMBEDDING_DIM")
                .unwrap_or_else(|_| "384".to_string())
                .parse()?,
            bi_encoder_model_path: PathBuf::from(
                env::var("BI_ENCODER_MODEL_PATH")
                    .unwrap_or_else(|_| "./bi-encoder-model/model_int8.onnx".to_string()),
            ),
            bi_encoder_tokenizer_path: PathBuf::from(
                env::var("BI_ENCODER_TOKENIZER_PATH")
                    .unwrap_or_else(|_| "./bi-encoder-model/tokenizer.json".to_string()),
            ),
            max_sequence_length: env::var("MAX_SEQ_LENGTH")
                .unwrap_or_else(|_| "512".to_string())
                .parse()?,
            pool_size: env::var("POOL_SIZE").ok().and_then(|s| s.parse().ok()),
            batch_size: env::var("BATCH_SIZE")
                .unwrap_or_else(|_| "32".to_string())
                .parse()?,
            embeddings_cache_path: env::var("EMBEDDINGS_CACHE_PATH").ok().map(PathBuf::from),
            discover_threshold,
            execute_threshold,
            default_top_k: env::var("DEFAULT_TOP_K")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            call_timeout: match env::var("CALL_TIMEOUT_MS") {
                Ok(ms) => Some(Duration::from_millis(ms.parse()?)),
                Err(_) => None,
            },
            terminate_grace: Duration::from_millis(
                env::var("TERMINATE_GRACE_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()?,
            ),
            validate_arguments: matches!(
                env::var("VALIDATE_ARGUMENTS")
                    .unwrap_or_default()
                    .to_lowercase()
                    .as_str(),
                "1" | "true" | "yes" | "on"
            ),
            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            log_format,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            catalog_path: PathBuf::from("./config/registry.json"),
            embedder: EmbedderKind::Hash,
            embedding_dim: 384,
            bi_encoder_model_path: PathBuf::from("./bi-encoder-model/model_int8.onnx"),
            bi_encoder_tokenizer_path: PathBuf::from("./bi-encoder-model/tokenizer.json"),
            max_sequence_length: 512,
            pool_size: None,
            batch_size: 32,
            embeddings_cache_path: None,
            discover_threshold: 0.5,
            execute_threshold: 0.6,
            default_top_k: 10,
            call_timeout: None,
            terminate_grace: Duration::from_secs(5),
            validate_arguments: false,
            shutdown_timeout_secs: 5,
            log_format: LogFormat::Text,
        }
    }
}
