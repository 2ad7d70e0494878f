//! Client configuration and saved server tokens.
//!
//! Configuration is searched in xdg config directories at
//! `arq/client_config.json`. If not found or failed to parse, defaults are
//! used. Environment variables override the file.

use nanoserde::DeJson;
use std::path::PathBuf;
use tracing::debug;

/// Client side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hostname of the array server
    pub server: String,
    /// Port of the array server
    pub port: u16,
    /// Socket timeout in seconds, zero means no timeout
    pub timeout: u64,
    /// Capacity of the deferred command queue
    pub queue_capacity: usize,
    /// Element count threshold above which Display does not print values
    pub print_threshold: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: "localhost".into(),
            port: 5555,
            timeout: 0,
            queue_capacity: 2,
            print_threshold: 100,
        }
    }
}

#[derive(Debug, Default, DeJson)]
struct FileConfig {
    server: Option<String>,
    port: Option<u16>,
    timeout: Option<u64>,
    queue_capacity: Option<usize>,
    print_threshold: Option<u64>,
}

impl ClientConfig {
    /// Load configuration from the first `arq/client_config.json` found in
    /// the xdg config directories, then apply `ARQ_SERVER`, `ARQ_PORT`,
    /// `ARQ_TIMEOUT` and `ARQ_QUEUE` environment overrides.
    pub fn load() -> Self {
        let mut config = ClientConfig::default();
        let file_config = xdg::BaseDirectories::new()
            .map_err(|e| {
                debug!("failed to find config directories for client_config.json, {e}");
            })
            .ok()
            .map(|bd| {
                let mut dirs = bd.get_config_dirs();
                dirs.push(bd.get_config_home());
                dirs
            })
            .and_then(|paths| {
                paths.into_iter().find_map(|mut path| {
                    path.push("arq/client_config.json");
                    std::fs::read_to_string(&path).ok()
                })
            })
            .and_then(|file| {
                FileConfig::deserialize_json(&file)
                    .map_err(|e| {
                        debug!("failed to parse client_config.json, {e}");
                    })
                    .ok()
            })
            .unwrap_or_default();
        if let Some(server) = file_config.server {
            config.server = server;
        }
        if let Some(port) = file_config.port {
            config.port = port;
        }
        if let Some(timeout) = file_config.timeout {
            config.timeout = timeout;
        }
        if let Some(capacity) = file_config.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(threshold) = file_config.print_threshold {
            config.print_threshold = threshold;
        }

        if let Ok(server) = std::env::var("ARQ_SERVER") {
            config.server = server;
        }
        if let Ok(port) = std::env::var("ARQ_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(timeout) = std::env::var("ARQ_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                config.timeout = timeout;
            }
        }
        if let Ok(capacity) = std::env::var("ARQ_QUEUE") {
            if let Ok(capacity) = capacity.parse() {
                config.queue_capacity = capacity;
            }
        }
        config
    }

    /// The `host:port` connect string identifying this server in the token store.
    pub fn connect_string(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

fn tokens_path() -> Option<PathBuf> {
    let bd = xdg::BaseDirectories::new().ok()?;
    let mut path = bd.get_data_home();
    path.push("arq/tokens.txt");
    Some(path)
}

fn read_tokens(path: &PathBuf) -> Vec<(String, String)> {
    let Ok(file) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    file.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(',')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Token previously saved for the given `host:port` connect string.
pub fn saved_token(connect_string: &str) -> Option<String> {
    let path = tokens_path()?;
    read_tokens(&path)
        .into_iter()
        .find(|(key, _)| key == connect_string)
        .map(|(_, value)| value)
}

/// Persist the token for the given `host:port` connect string, replacing
/// any previous entry. Failures are logged and ignored, a token that
/// cannot be saved can still be used for this session.
pub fn save_token(connect_string: &str, token: &str) {
    let Some(path) = tokens_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let mut tokens = read_tokens(&path);
    tokens.retain(|(key, _)| key != connect_string);
    tokens.push((connect_string.to_string(), token.to_string()));
    let mut file = String::new();
    for (key, value) in tokens {
        file.push_str(&key);
        file.push(',');
        file.push_str(&value);
        file.push('\n');
    }
    if let Err(e) = std::fs::write(&path, file) {
        debug!("failed to write tokens.txt at {path:?}, {e}");
    }
}
