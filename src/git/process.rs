use std::path::Path;

use tokio::fs;
use tokio::process::Command;

use crate::error::{Error, Result};

pub const POST_RECEIVE_HOOK: &str = "#!/bin/sh\n\
# Called by git-receive-pack after a successful push\n\
echo \"Repository updated successfully!\"\n";

/// The two server-side Git programs, read (fetch/clone) and write (push).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// Parses the `service` query value or the dashed program name.
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand for `git <verb> <path>`.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Environment flag that enables this service in `git http-backend`.
    pub fn backend_enable_var(&self) -> &'static str {
        match self {
            Self::UploadPack => "GIT_HTTP_UPLOAD_PACK",
            Self::ReceivePack => "GIT_HTTP_RECEIVE_PACK",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::ReceivePack)
    }
}

/// Creates a bare repository with the default post-receive hook installed.
pub async fn init_bare_repo(repo_path: &Path) -> Result<()> {
    if let Some(parent) = repo_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let output = Command::new("git")
        .args(["init", "--bare", "--quiet"])
        .arg(repo_path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::BadRequest(format!(
            "Failed to init bare repo: {stderr}"
        )));
    }

    let hooks_dir = repo_path.join("hooks");
    fs::create_dir_all(&hooks_dir).await?;

    let hook_path = hooks_dir.join("post-receive");
    fs::write(&hook_path, POST_RECEIVE_HOOK).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_service_from_name() {
        assert_eq!(
            GitService::from_name("git-upload-pack"),
            Some(GitService::UploadPack)
        );
        assert_eq!(
            GitService::from_name("git-receive-pack"),
            Some(GitService::ReceivePack)
        );
        assert_eq!(GitService::from_name("invalid"), None);
    }

    #[test]
    fn test_content_type_table() {
        assert_eq!(
            GitService::UploadPack.advertisement_content_type(),
            "application/x-git-upload-pack-advertisement"
        );
        assert_eq!(
            GitService::ReceivePack.advertisement_content_type(),
            "application/x-git-receive-pack-advertisement"
        );
        assert_eq!(
            GitService::UploadPack.content_type(),
            "application/x-git-upload-pack-result"
        );
        assert_eq!(
            GitService::ReceivePack.content_type(),
            "application/x-git-receive-pack-result"
        );
    }

    #[tokio::test]
    async fn test_init_bare_repo_installs_hook() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("alice").join("proj.git");

        init_bare_repo(&path).await.unwrap();

        assert!(path.join("HEAD").is_file());
        let hook = std::fs::read_to_string(path.join("hooks/post-receive")).unwrap();
        assert_eq!(hook, POST_RECEIVE_HOOK);
    }
}
