//! Bearer token sources.
//!
//! The token is read fresh for every connect attempt and never cached by the
//! client; rotating it is the store's business.

use configuration::CredentialSettings;
use std::path::PathBuf;
use std::sync::Arc;

/// Supplies the bearer token presented to the hub.
pub trait CredentialSource: Send + Sync {
    /// The current token, or `None` when the user is not signed in.
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self().and_then(non_empty)
    }
}

/// A fixed token, mostly useful for tests and scripts.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        non_empty(self.0.clone())
    }
}

/// Reads the token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var).ok().and_then(non_empty)
    }
}

/// Reads the token from a file on every call, so a login flow (or a secrets
/// mount) can rewrite it underneath a running client.
#[derive(Debug, Clone)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileToken {
    fn bearer_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => non_empty(contents),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Token file is not readable.");
                None
            }
        }
    }
}

/// Builds the credential source named by the configuration.
pub fn from_settings(settings: &CredentialSettings) -> Arc<dyn CredentialSource> {
    match &settings.token_file {
        Some(path) => Arc::new(FileToken::new(path.clone())),
        None => Arc::new(EnvToken::new(settings.token_env.clone())),
    }
}

fn non_empty(token: String) -> Option<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn blank_tokens_count_as_missing() {
        assert_eq!(StaticToken::new("   ").bearer_token(), None);
        assert_eq!(StaticToken::new(" abc \n").bearer_token().as_deref(), Some("abc"));
        let closure = || Some(String::new());
        assert_eq!(closure.bearer_token(), None);
    }

    #[test]
    fn file_token_is_reread_on_every_call() {
        let dir = std::env::temp_dir().join(format!("stockhub-token-{}", uuid::Uuid::new_v4()));
        let source = FileToken::new(&dir);
        assert_eq!(source.bearer_token(), None);

        let mut file = std::fs::File::create(&dir).unwrap();
        writeln!(file, "first").unwrap();
        assert_eq!(source.bearer_token().as_deref(), Some("first"));

        std::fs::write(&dir, "second").unwrap();
        assert_eq!(source.bearer_token().as_deref(), Some("second"));
        std::fs::remove_file(&dir).unwrap();
    }

    #[test]
    fn settings_prefer_the_token_file() {
        let settings = CredentialSettings {
            token_env: "STOCKHUB_TEST_UNSET_TOKEN".into(),
            token_file: Some(PathBuf::from("/definitely/not/here")),
        };
        assert_eq!(from_settings(&settings).bearer_token(), None);
    }
}
