//! Session configuration for the CLI
//!
//! Starts from `SessionConfig::default()`, applies the JSON config file if
//! one is given (or found in the user's config directory), then the ICE
//! server flags.

use anyhow::{Context, Result};
use safetalk_call_core::{IceServer, SessionConfig};
use std::path::{Path, PathBuf};

/// A TURN relay given on the command line as `url,username,credential`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnArg(pub IceServer);

impl std::str::FromStr for TurnArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ',');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(url), Some(username), Some(credential))
                if url.starts_with("turn:") || url.starts_with("turns:") =>
            {
                Ok(Self(IceServer::turn(url, username, credential)))
            }
            _ => Err(format!(
                "expected turn:<host>:<port>,<username>,<credential>, got {s}"
            )),
        }
    }
}

/// Default config file location, `<config dir>/safetalk-call/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "safetalk", "safetalk-call")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// Read a JSON session config
pub fn load_file(path: &Path) -> Result<SessionConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Build the session config from an optional file and ICE server flags
///
/// An explicit path must exist. The default path is used only if present.
/// STUN/TURN flags replace the configured ICE servers when any are given.
pub fn resolve(path: Option<&Path>, stun: &[String], turn: &[TurnArg]) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Using default config file");
                load_file(&path)?
            }
            None => SessionConfig::default(),
        },
    };

    if !stun.is_empty() || !turn.is_empty() {
        config.peer.ice_servers = stun
            .iter()
            .map(IceServer::stun)
            .chain(turn.iter().map(|t| t.0.clone()))
            .collect();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_turn_arg_parsing() {
        let arg: TurnArg = "turn:relay.example.org:3478,alice,s3cret".parse().unwrap();
        assert!(arg.0.is_turn());
        assert_eq!(arg.0.username.as_deref(), Some("alice"));
        assert_eq!(arg.0.credential.as_deref(), Some("s3cret"));

        assert!("stun:stun.example.org:3478,a,b".parse::<TurnArg>().is_err());
        assert!("turn:relay.example.org:3478".parse::<TurnArg>().is_err());
    }

    #[test]
    fn test_flags_replace_ice_servers() {
        let turn: TurnArg = "turn:relay:3478,u,p".parse().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let config = resolve(Some(&path), &["stun:a:3478".to_string()], &[turn]).unwrap();
        assert_eq!(config.peer.ice_servers.len(), 2);
        assert!(config.peer.has_turn());
    }

    #[test]
    fn test_file_values_are_kept() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"negotiation_timeout_secs": 12, "peer": {{"ice_servers": [], "include_loopback_candidates": true}}}}"#
        )
        .unwrap();

        let config = resolve(Some(file.path()), &[], &[]).unwrap();
        assert_eq!(config.negotiation_timeout_secs, 12);
        assert_eq!(config.ring_timeout_secs, 45);
        assert!(config.peer.ice_servers.is_empty());
        assert!(config.peer.include_loopback_candidates);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(resolve(Some(&missing), &[], &[]).is_err());
    }
}
