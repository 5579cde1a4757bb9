use crate::config::types::{Config, RequestConfig};
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// A `headers-file` in the session's request section is read and merged into
/// the request headers (inline headers win).
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use tidepool::config::load_config;
///
/// let config = load_config(Path::new("crawl.toml")).unwrap();
/// println!("Concurrency: {}", config.session.concurrency);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let mut config: Config = toml::from_str(&content)?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_headers_file(&mut config.session.request, base_dir)?;

    validate(&config)?;

    Ok(config)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

/// Loads request headers from a file with one `Name: value` pair per line
///
/// Blank lines are skipped, surrounding whitespace (including a trailing
/// `\r`) is trimmed, and only the first `:` separates name from value, so
/// values such as `Referer: https://example.com/` survive intact.
pub fn load_headers(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_headers(&content)
}

fn parse_headers(content: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut headers = BTreeMap::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            ConfigError::Headers(format!("line {} has no ':' separator: '{}'", number + 1, line))
        })?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Headers(format!(
                "line {} has an empty header name",
                number + 1
            )));
        }

        headers.insert(name.to_string(), value.trim().to_string());
    }

    Ok(headers)
}

fn resolve_headers_file(request: &mut RequestConfig, base_dir: &Path) -> Result<(), ConfigError> {
    let Some(file) = request.headers_file.take() else {
        return Ok(());
    };

    let file = if file.is_absolute() {
        file
    } else {
        base_dir.join(file)
    };

    let mut headers = load_headers(&file)?;
    headers.extend(std::mem::take(&mut request.headers));
    request.headers = headers;

    Ok(())
}
