//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Environment variable holding a cookie header, used when the file sets none.
pub const COOKIE_ENV: &str = "MEDIAFETCH_COOKIE";

/// `key = value` file configuration for mediafetch defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Root for relative item paths.
    pub output_dir: Option<PathBuf>,
    /// Concurrent workers.
    pub workers: Option<usize>,
    /// Attempts per HTTP request.
    pub max_retries: Option<u32>,
    /// Minimum spacing between requests in milliseconds.
    pub rate_limit: Option<u64>,
    /// Per-transfer cap in bytes per second.
    pub speed_limit: Option<u64>,
    /// Continue partial downloads.
    pub resume: Option<bool>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Cookie header sent with every request.
    pub cookie: Option<String>,
    /// User-Agent override.
    pub user_agent: Option<String>,
    /// Extra `Name: value` header sent with every request.
    pub auth_header: Option<(String, String)>,
    /// License URL template for protected items.
    pub license_url_template: Option<String>,
    /// Skip-decision hook program.
    pub skip_hook: Option<PathBuf>,
    /// Naming hook program.
    pub naming_hook: Option<PathBuf>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(workers) = self.workers
            && !(1..=64).contains(&workers)
        {
            bail!("Invalid config value for `workers`: {workers}. Expected range: 1..=64");
        }
        if let Some(max_retries) = self.max_retries
            && !(1..=10).contains(&max_retries)
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 1..=10");
        }
        if let Some(rate_limit) = self.rate_limit
            && rate_limit > 60_000
        {
            bail!("Invalid config value for `rate_limit`: {rate_limit}. Expected range: 0..=60000");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        if let Some(template) = &self.license_url_template
            && !template.contains("{media_id}")
        {
            bail!("Invalid config value for `license_url_template`: missing {{media_id}}");
        }
        Ok(())
    }

    /// The cookie from the file, else from [`COOKIE_ENV`].
    #[must_use]
    pub fn cookie_or_env(&self) -> Option<String> {
        self.cookie
            .clone()
            .or_else(|| env::var(COOKIE_ENV).ok().filter(|v| !v.trim().is_empty()))
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mediafetch/config.toml`
/// 2. `$HOME/.config/mediafetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("mediafetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("mediafetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the given path, or the default path if present.
pub fn load_file_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(read_file_config(path)?),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(read_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_number = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_number}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_number}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "workers" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.workers = Some(usize::try_from(parsed).with_context(invalid)?);
            }
            "max_retries" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                cfg.max_retries = Some(u32::try_from(parsed).with_context(invalid)?);
            }
            "rate_limit" => cfg.rate_limit = Some(parse_integer_u64(value).with_context(invalid)?),
            "speed_limit" => {
                cfg.speed_limit = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "resume" => cfg.resume = Some(parse_boolean(value).with_context(invalid)?),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "cookie" => cfg.cookie = Some(parse_string_literal(value).with_context(invalid)?),
            "user_agent" => {
                cfg.user_agent = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "auth_header" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.auth_header = Some(parse_header(&parsed).with_context(invalid)?);
            }
            "license_url_template" => {
                cfg.license_url_template =
                    Some(parse_string_literal(value).with_context(invalid)?);
            }
            "skip_hook" => {
                cfg.skip_hook = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "naming_hook" => {
                cfg.naming_hook = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_number}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("Expected 'Name: value'");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty");
    }
    Ok((name.to_string(), value.trim().to_string()))
}
