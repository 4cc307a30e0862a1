//! `toolgate init`: write the default config template once.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const CONFIG_TEMPLATE: &str = include_str!("../../config-templates/config.toml");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Created(PathBuf),
    /// A file was already there and was left untouched.
    Kept(PathBuf),
}

/// Write the template to `config_path`, or `~/.toolgate/config.toml`.
pub async fn initialize(config_path: Option<PathBuf>) -> Result<InitOutcome> {
    write_template(&config_path.unwrap_or_else(crate::config::default_config_path)).await
}

async fn write_template(target: &Path) -> Result<InitOutcome> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("create config dir {}: {e}", parent.display()))?;
    }
    // Never overwrite, even if two inits race.
    let opened = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Ok(InitOutcome::Kept(target.to_path_buf()));
        }
        Err(e) => return Err(anyhow::anyhow!("open {}: {e}", target.display())),
    };
    file.write_all(CONFIG_TEMPLATE.as_bytes())
        .await
        .map_err(|e| anyhow::anyhow!("write config template {}: {e}", target.display()))?;
    file.flush().await?;
    tracing::info!(path = %target.display(), "config template written");
    Ok(InitOutcome::Created(target.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolgateConfig;

    #[tokio::test]
    async fn writes_a_template_that_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("toolgate/config.toml");
        let outcome = initialize(Some(target.clone())).await.expect("init");
        assert_eq!(outcome, InitOutcome::Created(target.clone()));

        let written = std::fs::read_to_string(&target).unwrap();
        let cfg = ToolgateConfig::parse(&written).expect("template parses");
        cfg.validate().expect("template validates");
    }

    #[tokio::test]
    async fn existing_config_is_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("config.toml");
        std::fs::write(&target, "# mine\n").unwrap();

        let outcome = initialize(Some(target.clone())).await.expect("init");
        assert_eq!(outcome, InitOutcome::Kept(target.clone()));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "# mine\n");
    }
}
