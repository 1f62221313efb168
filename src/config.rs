use serde::Deserialize;

/// Which document store backs the relation graph
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Elasticsearch,
    Redis,
}

/// How neighbour documents are rewritten during propagation
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Plain upsert; concurrent writers to one document may lose updates
    LastWriterWins,
    /// Version-checked upsert, re-read and retry on conflict
    Optimistic,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Store backend selection
    #[serde(default = "default_store_backend")]
    pub store_backend: StoreBackend,

    /// Elasticsearch base URL
    #[serde(default = "default_elasticsearch_url")]
    pub elasticsearch_url: String,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Collection used when a request does not name a user collection
    #[serde(default = "default_user_collection")]
    pub user_collection: String,

    /// Collection used when a request does not name a movie collection
    #[serde(default = "default_movie_collection")]
    pub movie_collection: String,

    #[serde(default = "default_write_mode")]
    pub write_mode: WriteMode,

    /// Attempts per document before an optimistic write gives up
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Rewrite neighbour documents of one call concurrently
    #[serde(default)]
    pub parallel_propagation: bool,

    /// Page size of term searches; every page is fetched, so this never caps results
    #[serde(default = "default_search_size")]
    pub search_size: usize,

    /// Elasticsearch `refresh` parameter for writes, empty to omit
    #[serde(default = "default_refresh_policy")]
    pub refresh_policy: String,

    #[serde(default = "default_index_shards")]
    pub index_shards: u32,

    #[serde(default = "default_index_replicas")]
    pub index_replicas: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_elasticsearch_url() -> String {
    "http://localhost:10000".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_user_collection() -> String {
    "users".to_string()
}

fn default_movie_collection() -> String {
    "movies".to_string()
}

fn default_write_mode() -> WriteMode {
    WriteMode::LastWriterWins
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_search_size() -> usize {
    10_000
}

fn default_refresh_policy() -> String {
    "wait_for".to_string()
}

fn default_index_shards() -> u32 {
    5
}

fn default_index_replicas() -> u32 {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    /// Socket address the server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store_backend: default_store_backend(),
            elasticsearch_url: default_elasticsearch_url(),
            redis_url: default_redis_url(),
            user_collection: default_user_collection(),
            movie_collection: default_movie_collection(),
            write_mode: default_write_mode(),
            max_conflict_retries: default_max_conflict_retries(),
            parallel_propagation: false,
            search_size: default_search_size(),
            refresh_policy: default_refresh_policy(),
            index_shards: default_index_shards(),
            index_replicas: default_index_replicas(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_environment() {
        let config: Config = envy::from_iter(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.user_collection, "users");
        assert_eq!(config.movie_collection, "movies");
        assert_eq!(config.write_mode, WriteMode::LastWriterWins);
        assert!(!config.parallel_propagation);
    }

    #[test]
    fn test_parses_backend_and_write_mode() {
        let vars = vec![
            ("STORE_BACKEND".to_string(), "elasticsearch".to_string()),
            ("WRITE_MODE".to_string(), "optimistic".to_string()),
            ("MAX_CONFLICT_RETRIES".to_string(), "9".to_string()),
            ("PARALLEL_PROPAGATION".to_string(), "true".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Elasticsearch);
        assert_eq!(config.write_mode, WriteMode::Optimistic);
        assert_eq!(config.max_conflict_retries, 9);
        assert!(config.parallel_propagation);
    }

    #[test]
    fn test_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:5000");
    }
}
