use serde::{Deserialize, Serialize};

// Identity = hex-encoded identity-key hash, compared byte for byte
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IdentityHash(pub String);

impl IdentityHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Sender-chosen attachment identifier.  The chunked-file message created for
/// an attachment reuses this value as its message id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
