use std::fmt;

use super::locator::{strip_git_suffix, validate_name};
use super::process::GitService;

/// `owner/repo` as named by a client, without a leading `/` or `.git` suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl RepoSlug {
    /// Parses `[/]owner/repo[.git]`. Exactly two segments are accepted.
    pub fn parse(path: &str) -> Result<Self, String> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = strip_git_suffix(path);

        let (owner, repo) = path
            .split_once('/')
            .ok_or_else(|| format!("invalid repository path: {path}"))?;

        if repo.contains('/') || validate_name(owner).is_err() || validate_name(repo).is_err() {
            return Err(format!("invalid repository path: {path}"));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// A parsed SSH `exec` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    UploadPack(RepoSlug),
    ReceivePack(RepoSlug),
    /// Anything else; carries the message written to the client.
    Unrecognized(String),
}

impl GitCommand {
    pub fn service(&self) -> Option<GitService> {
        match self {
            Self::UploadPack(_) => Some(GitService::UploadPack),
            Self::ReceivePack(_) => Some(GitService::ReceivePack),
            Self::Unrecognized(_) => None,
        }
    }

    pub fn slug(&self) -> Option<&RepoSlug> {
        match self {
            Self::UploadPack(slug) | Self::ReceivePack(slug) => Some(slug),
            Self::Unrecognized(_) => None,
        }
    }

    fn new(service: GitService, slug: RepoSlug) -> Self {
        match service {
            GitService::UploadPack => Self::UploadPack(slug),
            GitService::ReceivePack => Self::ReceivePack(slug),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Word {
    text: String,
    quoted: bool,
}

/// Splits a command line into words. Single and double quotes group
/// characters; there are no escapes.
fn tokenize(input: &str) -> Result<Vec<Word>, String> {
    let mut words = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut text = String::new();
        let mut quoted = false;

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();

            if c == '\'' || c == '"' {
                quoted = true;
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == c {
                        closed = true;
                        break;
                    }
                    text.push(inner);
                }
                if !closed {
                    return Err("unterminated quote in command".to_string());
                }
            } else {
                text.push(c);
            }
        }

        words.push(Word { text, quoted });
    }

    Ok(words)
}

/// Parses the command string of an SSH `exec` request.
///
/// Accepted forms:
///
/// ```text
/// git-upload-pack '<path>'
/// git-receive-pack '<path>'
/// git upload-pack <path>
/// git receive-pack <path>
/// ```
pub fn parse_command(command: &str) -> GitCommand {
    let words = match tokenize(command) {
        Ok(words) => words,
        Err(reason) => return GitCommand::Unrecognized(reason),
    };

    let (service, path) = match words.as_slice() {
        [program, path] if !program.quoted => match GitService::from_name(&program.text) {
            Some(_) if !path.quoted => {
                return GitCommand::Unrecognized(
                    "repository path must be quoted".to_string(),
                );
            }
            Some(service) => (service, path),
            None => return unsupported(command),
        },
        [git, verb, path] if git.text == "git" && !git.quoted => {
            match GitService::from_name(&format!("git-{}", verb.text)) {
                Some(service) if !verb.quoted => (service, path),
                _ => return unsupported(command),
            }
        }
        _ => return unsupported(command),
    };

    match RepoSlug::parse(&path.text) {
        Ok(slug) => GitCommand::new(service, slug),
        Err(reason) => GitCommand::Unrecognized(reason),
    }
}

fn unsupported(command: &str) -> GitCommand {
    GitCommand::Unrecognized(format!("unsupported command: {}", command.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(owner: &str, repo: &str) -> RepoSlug {
        RepoSlug {
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
    }

    #[test]
    fn test_upload_pack_with_leading_slash_and_suffix() {
        assert_eq!(
            parse_command("git-upload-pack '/alice/proj.git'"),
            GitCommand::UploadPack(slug("alice", "proj"))
        );
    }

    #[test]
    fn test_receive_pack_without_suffix() {
        assert_eq!(
            parse_command("git-receive-pack 'alice/proj'"),
            GitCommand::ReceivePack(slug("alice", "proj"))
        );
    }

    #[test]
    fn test_double_quotes() {
        assert_eq!(
            parse_command("git-upload-pack \"/my-org/my-repo.git\""),
            GitCommand::UploadPack(slug("my-org", "my-repo"))
        );
    }

    #[test]
    fn test_generic_git_verb_form() {
        assert_eq!(
            parse_command("git upload-pack /alice/proj.git"),
            GitCommand::UploadPack(slug("alice", "proj"))
        );
        assert_eq!(
            parse_command("git receive-pack 'alice/proj'"),
            GitCommand::ReceivePack(slug("alice", "proj"))
        );
    }

    #[test]
    fn test_unquoted_dashed_form_is_rejected() {
        assert!(matches!(
            parse_command("git-upload-pack noquotes"),
            GitCommand::Unrecognized(_)
        ));
        assert!(matches!(
            parse_command("git-upload-pack alice/proj"),
            GitCommand::Unrecognized(_)
        ));
    }

    #[test]
    fn test_wrong_segment_count_is_rejected() {
        for cmd in [
            "git-upload-pack 'noslash'",
            "git-upload-pack '/a/b/c.git'",
            "git-upload-pack ''",
            "git-upload-pack '/alice/'",
        ] {
            assert!(
                matches!(parse_command(cmd), GitCommand::Unrecognized(_)),
                "{cmd} should not parse"
            );
        }
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        assert!(matches!(
            parse_command("git-upload-pack '../etc'"),
            GitCommand::Unrecognized(_)
        ));
        assert!(matches!(
            parse_command("git-upload-pack '/alice/..'"),
            GitCommand::Unrecognized(_)
        ));
    }

    #[test]
    fn test_other_commands_are_unrecognized() {
        for cmd in [
            "ls -la",
            "git-upload-archive 'alice/proj'",
            "git log alice/proj",
            "git-upload-pack 'alice/proj' extra",
            "git-upload-pack 'alice/proj",
            "",
        ] {
            assert!(
                matches!(parse_command(cmd), GitCommand::Unrecognized(_)),
                "{cmd} should not parse"
            );
        }
    }

    #[test]
    fn test_accessors() {
        let cmd = parse_command("git-receive-pack 'alice/proj.git'");
        assert_eq!(cmd.service(), Some(GitService::ReceivePack));
        assert_eq!(cmd.slug().map(ToString::to_string), Some("alice/proj".to_string()));

        let cmd = parse_command("whoami");
        assert_eq!(cmd.service(), None);
        assert!(cmd.slug().is_none());
    }
}
