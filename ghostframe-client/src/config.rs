//! Persisted client settings and the directories the client writes to.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::BackendCommand;

/// `config.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
const APP_DIR_NAME: &str = "GhostFrame";
const BACKEND_BINARY_NAME: &str = "ghostframe-backend";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

impl SavedClientConfig {
    /// Fields set in `overrides` win; unset ones fall back to `self`.
    pub fn merged_with(self, overrides: SavedClientConfig) -> SavedClientConfig {
        SavedClientConfig {
            display_name: overrides.display_name.or(self.display_name),
            backend: overrides.backend.or(self.backend),
            backend_args: if overrides.backend_args.is_empty() {
                self.backend_args
            } else {
                overrides.backend_args
            },
            download_dir: overrides.download_dir.or(self.download_dir),
        }
    }
}

/// Effective settings after defaults are filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub display_name: Option<String>,
    pub backend: BackendCommand,
    pub backend_args: Vec<String>,
    pub download_dir: PathBuf,
}

impl ClientSettings {
    pub fn resolve(config: SavedClientConfig) -> Result<Self, ConfigError> {
        validate_config(&config)?;
        Ok(Self {
            display_name: config.display_name.map(|name| name.trim().to_owned()),
            backend: config.backend.unwrap_or_else(default_backend_command),
            backend_args: config.backend_args,
            download_dir: config.download_dir.unwrap_or_else(default_download_dir),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("invalid config:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("create dir failed: {0}")]
    CreateDir(#[source] io::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn validate_config(config: &SavedClientConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if let Some(name) = config.display_name.as_deref() {
        let name = name.trim();
        if name.is_empty() {
            errors.push("Display name must not be blank.".to_owned());
        } else if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            errors.push(format!(
                "Display name is too long ({} > {} chars).",
                name.chars().count(),
                MAX_DISPLAY_NAME_LEN
            ));
        }
    }

    match &config.backend {
        Some(BackendCommand::Dev {
            interpreter,
            script,
        }) => {
            if interpreter.as_os_str().is_empty() {
                errors.push("Backend interpreter path is required.".to_owned());
            }
            if script.as_os_str().is_empty() {
                errors.push("Backend script path is required.".to_owned());
            }
        }
        Some(BackendCommand::Packaged { binary }) => {
            if binary.as_os_str().is_empty() {
                errors.push("Backend binary path is required.".to_owned());
            }
        }
        None => {}
    }

    if config
        .download_dir
        .as_ref()
        .is_some_and(|dir| dir.as_os_str().is_empty())
    {
        errors.push("Download directory must not be empty.".to_owned());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn app_dir(override_var: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(override_var) {
        return PathBuf::from(dir);
    }
    if let Some(base) = std::env::var_os("LOCALAPPDATA") {
        return PathBuf::from(base).join(APP_DIR_NAME);
    }
    if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(base).join("ghostframe");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("ghostframe");
    }
    PathBuf::from(".")
}

pub fn config_path() -> PathBuf {
    app_dir("GHOSTFRAME_CONFIG_DIR").join("config.json")
}

pub fn data_dir() -> PathBuf {
    app_dir("GHOSTFRAME_DATA_DIR")
}

pub fn log_path() -> PathBuf {
    let dir = data_dir().join("logs");
    let _ = fs::create_dir_all(&dir);
    dir.join("ghostframe.log")
}

pub fn default_download_dir() -> PathBuf {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads")
        .join(APP_DIR_NAME)
}

/// The packaged backend next to the running executable, else whatever is on `PATH`.
pub fn default_backend_command() -> BackendCommand {
    let file_name = format!("{BACKEND_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .filter(|path| path.is_file());
    BackendCommand::Packaged {
        binary: sibling.unwrap_or_else(|| PathBuf::from(file_name)),
    }
}

pub fn parse_config_json(data: &str) -> Result<SavedClientConfig, serde_json::Error> {
    serde_json::from_str::<SavedClientConfig>(data)
}

/// `Ok(None)` when no config has been saved yet.
pub fn load_config_from_path(path: &Path) -> Result<Option<SavedClientConfig>, ConfigError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ConfigError::Metadata(err)),
    };
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigError::Read)?;
    let config = parse_config_json(&data).map_err(ConfigError::Parse)?;
    validate_config(&config)?;
    Ok(Some(config))
}

pub fn save_config_to_path(path: &Path, config: &SavedClientConfig) -> Result<(), ConfigError> {
    validate_config(config)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(ConfigError::CreateDir)?;
    }

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(ConfigError::Rename)?;
    Ok(())
}

pub fn save_config_with_retry(path: &Path, config: &SavedClientConfig) -> Result<(), ConfigError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_config_to_path(path, config) {
            Ok(()) => return Ok(()),
            Err(err @ ConfigError::Invalid(_)) => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win_over_saved_values() {
        let saved = SavedClientConfig {
            display_name: Some("Alice".to_owned()),
            backend: Some(BackendCommand::Packaged {
                binary: PathBuf::from("/opt/ghostframe/backend"),
            }),
            backend_args: vec!["--peer".to_owned(), "Bob".to_owned()],
            download_dir: Some(PathBuf::from("/tmp/saved")),
        };
        let overrides = SavedClientConfig {
            display_name: Some("Carol".to_owned()),
            ..SavedClientConfig::default()
        };

        let merged = saved.clone().merged_with(overrides);
        assert_eq!(merged.display_name.as_deref(), Some("Carol"));
        assert_eq!(merged.backend, saved.backend);
        assert_eq!(merged.backend_args, saved.backend_args);
        assert_eq!(merged.download_dir, saved.download_dir);
    }

    #[test]
    fn blank_display_name_is_invalid() {
        let config = SavedClientConfig {
            display_name: Some("   ".to_owned()),
            ..SavedClientConfig::default()
        };
        let err = ClientSettings::resolve(config).unwrap_err();
        assert!(err.to_string().contains("Display name"), "{err}");
    }

    #[test]
    fn backend_command_is_tagged_in_json() {
        let config = parse_config_json(
            r#"{"backend": {"kind": "dev", "interpreter": "python3", "script": "backend/api.py"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.backend,
            Some(BackendCommand::Dev {
                interpreter: PathBuf::from("python3"),
                script: PathBuf::from("backend/api.py"),
            })
        );
    }
}
