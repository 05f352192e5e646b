//! Credential tokens handed to every container.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::MasterError;

/// Environment variable naming the token file of the current process.
pub const TOKEN_FILE_ENV: &str = "HADOOP_TOKEN_FILE_LOCATION";

/// Kind of the token the master uses to talk to the resource manager.
/// Containers must never receive it.
pub const AM_RM_TOKEN_KIND: &str = "YARN_AM_RM_TOKEN";

/// A single delegation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: String,
    pub service: String,
    pub identifier: String,
    pub password: String,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind: {}, Service: {}", self.kind, self.service)
    }
}

/// The token set of the current process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub tokens: Vec<Token>,
}

impl Credentials {
    /// Read a JSON token file.
    pub async fn load(path: &Path) -> Result<Self, MasterError> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            MasterError::Credentials(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            MasterError::Credentials(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load the token file named in the environment, or an empty set.
    pub async fn from_env(env: &HashMap<String, String>) -> Result<Self, MasterError> {
        match env.get(TOKEN_FILE_ENV) {
            Some(path) if !path.is_empty() => Self::load(Path::new(path)).await,
            _ => Ok(Self::default()),
        }
    }

    /// Copy of this set without tokens of the given kind.
    pub fn without_kind(&self, kind: &str) -> Self {
        Self {
            tokens: self
                .tokens
                .iter()
                .filter(|t| t.kind != kind)
                .cloned()
                .collect(),
        }
    }

    /// Build the blob shipped to containers: every token except the
    /// resource manager's own.
    pub fn container_blob(&self) -> Result<TokenBlob, MasterError> {
        info!("Executing with tokens:");
        for token in &self.tokens {
            info!("{}", token);
        }
        let stripped = self.without_kind(AM_RM_TOKEN_KIND);
        let bytes = serde_json::to_vec(&stripped)
            .map_err(|e| MasterError::Credentials(format!("failed to encode tokens: {}", e)))?;
        Ok(TokenBlob::new(bytes))
    }
}

/// Serialised tokens, shared read-only between all launch contexts.
///
/// Cloning is cheap and gives each container its own handle on the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenBlob(Arc<[u8]>);

impl TokenBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        TokenBlob(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode back into a token set.
    pub fn credentials(&self) -> Result<Credentials, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }
}

impl fmt::Debug for TokenBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print token material.
        write!(f, "TokenBlob({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(kind: &str, service: &str) -> Token {
        Token {
            kind: kind.to_string(),
            service: service.to_string(),
            identifier: "aWQ=".to_string(),
            password: "cHc=".to_string(),
        }
    }

    #[test]
    fn test_blob_strips_am_rm_token() {
        let creds = Credentials {
            tokens: vec![
                token("HDFS_DELEGATION_TOKEN", "ha-hdfs:nn"),
                token(AM_RM_TOKEN_KIND, "rm:8030"),
                token("TIMELINE_DELEGATION_TOKEN", "ats:8188"),
            ],
        };

        let blob = creds.container_blob().unwrap();
        let decoded = blob.credentials().unwrap();
        assert_eq!(decoded.tokens.len(), 2);
        assert!(decoded.tokens.iter().all(|t| t.kind != AM_RM_TOKEN_KIND));
        // The master keeps its own copy intact.
        assert_eq!(creds.tokens.len(), 3);
    }

    #[test]
    fn test_blob_clones_share_bytes() {
        let blob = Credentials::default().container_blob().unwrap();
        let copy = blob.clone();
        assert_eq!(blob.as_bytes(), copy.as_bytes());
        assert!(!blob.is_empty());
        assert_eq!(format!("{:?}", blob), format!("TokenBlob({} bytes)", blob.len()));
    }

    #[tokio::test]
    async fn test_from_env_without_token_file() {
        let creds = Credentials::from_env(&HashMap::new()).await.unwrap();
        assert!(creds.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_load_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let creds = Credentials {
            tokens: vec![token("HDFS_DELEGATION_TOKEN", "nn:8020")],
        };
        std::fs::write(&path, serde_json::to_vec(&creds).unwrap()).unwrap();

        let mut env = HashMap::new();
        env.insert(TOKEN_FILE_ENV.to_string(), path.display().to_string());
        assert_eq!(Credentials::from_env(&env).await.unwrap(), creds);
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            Credentials::load(&path).await,
            Err(MasterError::Credentials(_))
        ));
    }
}
