//! Application descriptions: what a content exchanges.

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::error::{JingleError, Result};
use crate::protocol::NS_FILE_TRANSFER;

/// Description variants, one per application namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Description {
    /// File offer or request
    FileTransfer(FileTransfer),
}

impl Description {
    /// Namespace of this variant
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::FileTransfer(_) => NS_FILE_TRANSFER,
        }
    }

    /// Render to wire form
    pub fn to_payload(&self) -> Result<Payload> {
        match self {
            Self::FileTransfer(ft) => Payload::encode(NS_FILE_TRANSFER, ft),
        }
    }

    /// Decoder registered for [`NS_FILE_TRANSFER`]
    pub fn decode_file_transfer(payload: &Payload) -> Result<Self> {
        let ft: FileTransfer = payload.decode()?;
        ft.validate()?;
        Ok(Self::FileTransfer(ft))
    }

    /// Get the file-transfer description, if that is what this is
    pub fn as_file_transfer(&self) -> Option<&FileTransfer> {
        match self {
            Self::FileTransfer(ft) => Some(ft),
        }
    }
}

/// Whether the creator pushes or pulls the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileDirection {
    /// Creator sends the file
    #[default]
    Offer,
    /// Creator asks the peer for the file
    Request,
}

/// File-transfer description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Offer or request
    #[serde(default)]
    pub direction: FileDirection,
    /// File metadata
    pub file: FileInfo,
}

impl FileTransfer {
    /// Offer a file
    pub fn offer(file: FileInfo) -> Self {
        Self {
            direction: FileDirection::Offer,
            file,
        }
    }

    /// Request a file
    pub fn request(file: FileInfo) -> Self {
        Self {
            direction: FileDirection::Request,
            file,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.file.name {
            if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
                return Err(JingleError::ProtocolViolation(format!(
                    "unsafe file name: {:?}",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileInfo {
    /// File name (no path components)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// MIME type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Last modification (ISO 8601)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Content hash
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashValue>,
}

impl FileInfo {
    /// Metadata with a name and size
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: Some(name.to_string()),
            size: Some(size),
            ..Default::default()
        }
    }

    /// Attach a media type
    pub fn with_media_type(mut self, media_type: &str) -> Self {
        self.media_type = Some(media_type.to_string());
        self
    }

    /// Attach a hash
    pub fn with_hash(mut self, algo: &str, value: &str) -> Self {
        self.hash = Some(HashValue {
            algo: algo.to_string(),
            value: value.to_string(),
        });
        self
    }
}

/// A digest computed elsewhere, carried opaquely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashValue {
    /// Algorithm name (e.g. `sha-256`)
    pub algo: String,
    /// Base64 digest
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_offer_roundtrip() {
        let desc = Description::FileTransfer(FileTransfer::offer(
            FileInfo::new("test.txt", 6144)
                .with_media_type("text/plain")
                .with_hash("sha-256", "w0mcJylzCn+AfvuGdqkty2+KP48="),
        ));
        let payload = desc.to_payload().unwrap();
        assert_eq!(payload.namespace, NS_FILE_TRANSFER);
        assert_eq!(payload.body["file"]["name"], "test.txt");
        assert!(payload.body["file"].get("date").is_none());

        assert_eq!(Description::decode_file_transfer(&payload).unwrap(), desc);
    }

    #[test]
    fn test_direction_defaults_to_offer() {
        let payload = Payload::new(NS_FILE_TRANSFER, json!({"file": {"name": "a.bin"}}));
        let desc = Description::decode_file_transfer(&payload).unwrap();
        assert_eq!(
            desc.as_file_transfer().unwrap().direction,
            FileDirection::Offer
        );
    }

    #[test]
    fn test_rejects_path_traversal() {
        for name in ["../etc/passwd", "..", "dir\\file", ""] {
            let payload = Payload::new(NS_FILE_TRANSFER, json!({"file": {"name": name}}));
            assert!(Description::decode_file_transfer(&payload).is_err(), "{name}");
        }
    }
}
