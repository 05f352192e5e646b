//! Local resource manifest: remote files a node agent materialises in the
//! container's working directory before running the command.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LaunchError;

/// How the node agent materialises a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalResourceType {
    /// Copied as-is.
    File,
    /// Unpacked into a directory.
    Archive,
}

/// Who may share a localized copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalResourceVisibility {
    Public,
    Private,
    Application,
}

/// A parsed remote location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLocation {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub file: String,
}

/// Characters that are never legal in a location, even percent-encoding aside.
const ILLEGAL_CHARS: &[char] = &['"', '<', '>', '\\', '^', '`', '{', '|', '}'];

/// Length of a leading URI scheme (`hdfs` in `hdfs://nn/x`), if there is one.
fn scheme_len(path: &str) -> Option<usize> {
    let colon = path.find(':')?;
    let scheme = &path[..colon];
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some(colon)
}

fn check_percent_escapes(path: &str) -> Result<(), String> {
    let bytes = path.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'%' {
            let escape = bytes.get(i + 1..i + 3);
            if !matches!(escape, Some([h, l]) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit()) {
                return Err(format!("malformed escape at index {}", i));
            }
        }
    }
    Ok(())
}

impl ResourceLocation {
    /// Resolve a remote path into a location.
    ///
    /// Accepts absolute URIs (`hdfs://nn:8020/apps/x.jar`, `file:///tmp/x`) and
    /// bare paths (`/apps/x.jar`). Does not check that the target exists.
    pub fn parse(path: &str) -> Result<Self, LaunchError> {
        let malformed = |reason: String| LaunchError::MalformedLocation {
            path: path.to_string(),
            reason,
        };

        if path.is_empty() {
            return Err(malformed("empty location".to_string()));
        }
        if let Some((i, c)) = path
            .char_indices()
            .find(|(_, c)| c.is_whitespace() || c.is_control() || ILLEGAL_CHARS.contains(c))
        {
            return Err(malformed(format!("illegal character {:?} at index {}", c, i)));
        }
        check_percent_escapes(path).map_err(malformed)?;

        if scheme_len(path).is_none() {
            return Ok(ResourceLocation {
                scheme: None,
                host: None,
                port: None,
                file: path.to_string(),
            });
        }

        let url = Url::parse(path).map_err(|e| malformed(e.to_string()))?;
        Ok(ResourceLocation {
            scheme: Some(url.scheme().to_string()),
            host: url.host_str().map(str::to_string),
            port: url.port(),
            file: url.path().to_string(),
        })
    }

    /// True if the location lives on this machine's filesystem.
    pub fn is_local(&self) -> bool {
        match self.scheme.as_deref() {
            None | Some("file") => self.host.as_deref().map_or(true, |h| h.is_empty()),
            _ => false,
        }
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}://", scheme)?;
            if let Some(host) = &self.host {
                write!(f, "{}", host)?;
            }
            if let Some(port) = self.port {
                write!(f, ":{}", port)?;
            }
        }
        write!(f, "{}", self.file)
    }
}

/// One entry of a container's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalResource {
    pub location: ResourceLocation,
    pub size: i64,
    pub timestamp: i64,
    pub kind: LocalResourceType,
    pub visibility: LocalResourceVisibility,
}

/// A file the job distributes to every container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedFile {
    pub path: String,
    pub size: i64,
    pub timestamp: i64,
    pub kind: LocalResourceType,
}

impl DistributedFile {
    /// Name of the resource inside the container's working directory.
    ///
    /// Files keep their last path segment; archives drop everything from the
    /// first `.` so `lib.tar.gz` unpacks into `lib`.
    pub fn manifest_key(&self) -> String {
        let name = self
            .path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        match self.kind {
            LocalResourceType::File => name.to_string(),
            LocalResourceType::Archive => name.split('.').next().unwrap_or_default().to_string(),
        }
    }

    pub fn to_local_resource(&self) -> Result<LocalResource, LaunchError> {
        Ok(LocalResource {
            location: ResourceLocation::parse(&self.path)?,
            size: self.size,
            timestamp: self.timestamp,
            kind: self.kind,
            visibility: LocalResourceVisibility::Application,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, kind: LocalResourceType) -> DistributedFile {
        DistributedFile {
            path: path.to_string(),
            size: 10,
            timestamp: 1000,
            kind,
        }
    }

    #[test]
    fn test_parse_hdfs_uri() {
        let loc = ResourceLocation::parse("hdfs://namenode:8020/apps/job/app.jar").unwrap();
        assert_eq!(loc.scheme.as_deref(), Some("hdfs"));
        assert_eq!(loc.host.as_deref(), Some("namenode"));
        assert_eq!(loc.port, Some(8020));
        assert_eq!(loc.file, "/apps/job/app.jar");
        assert!(!loc.is_local());
        assert_eq!(loc.to_string(), "hdfs://namenode:8020/apps/job/app.jar");
    }

    #[test]
    fn test_parse_bare_path_and_file_uri() {
        let bare = ResourceLocation::parse("/tmp/app.jar").unwrap();
        assert_eq!(bare.scheme, None);
        assert_eq!(bare.file, "/tmp/app.jar");
        assert!(bare.is_local());

        let file_uri = ResourceLocation::parse("file:///tmp/app.jar").unwrap();
        assert_eq!(file_uri.scheme.as_deref(), Some("file"));
        assert_eq!(file_uri.file, "/tmp/app.jar");
        assert!(file_uri.is_local());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "hdfs://nn/apps/my app.jar",
            "hdfs://nn:99999/x.jar",
            "hdfs://nn/x%zz.jar",
            "/apps/{x}.jar",
            "hdfs://[nn/x.jar",
        ] {
            assert!(
                matches!(
                    ResourceLocation::parse(bad),
                    Err(LaunchError::MalformedLocation { .. })
                ),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_manifest_keys() {
        assert_eq!(
            file("hdfs://nn/apps/app.jar", LocalResourceType::File).manifest_key(),
            "app.jar"
        );
        assert_eq!(
            file("hdfs://nn/apps/lib.tar.gz", LocalResourceType::Archive).manifest_key(),
            "lib"
        );
        assert_eq!(
            file("/apps/conf/", LocalResourceType::File).manifest_key(),
            "conf"
        );
    }

    #[test]
    fn test_to_local_resource_carries_metadata() {
        let res = file("hdfs://nn/apps/lib.zip", LocalResourceType::Archive)
            .to_local_resource()
            .unwrap();
        assert_eq!(res.kind, LocalResourceType::Archive);
        assert_eq!(res.visibility, LocalResourceVisibility::Application);
        assert_eq!(res.size, 10);
        assert_eq!(res.timestamp, 1000);
    }
}
