//! Opaque page-snapshot payloads.
//!
//! The cache never inspects snapshot content. A payload is a content-type
//! tag plus raw bytes, stored as one length-prefixed blob: a big-endian u32
//! tag length, the tag, then the data.

use bytes::{Buf, Bytes};

/// Browser viewport dimensions attached to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Viewport {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
}

impl Viewport {
    /// New viewport.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// An opaque snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPayload {
    /// Content-type tag ("text/html", "application/json", ...).
    pub content_type: String,
    /// The payload bytes.
    pub data: Bytes,
}

impl SnapshotPayload {
    /// New payload.
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Encode into the stored blob form.
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.content_type.as_bytes();
        let mut out = Vec::with_capacity(4 + tag.len() + self.data.len());
        out.extend_from_slice(&(tag.len() as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode a stored blob. Returns `None` on any malformation; a bad row
    /// is skipped, never an error.
    pub fn decode(blob: &[u8]) -> Option<Self> {
        let mut buf = blob;
        if buf.remaining() < 4 {
            return None;
        }
        let tag_len = buf.get_u32() as usize;
        if buf.remaining() < tag_len {
            return None;
        }
        let content_type = String::from_utf8(buf[..tag_len].to_vec()).ok()?;
        buf.advance(tag_len);
        Some(Self {
            content_type,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

/// Options for storing a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSetOptions {
    /// URL the snapshot belongs to.
    pub url: Option<String>,
    /// Browser profile; defaults to `"default"`.
    pub profile: Option<String>,
    /// Absolute TTL override in milliseconds.
    pub ttl_ms: Option<u64>,
    /// DOM content hash supplied by the caller.
    pub dom_hash: Option<String>,
    /// Viewport the snapshot was taken at.
    pub viewport: Option<Viewport>,
}

/// Options for retrieving a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotGetOptions {
    /// URL scope for the DOM-signature fallback search.
    pub url: Option<String>,
    /// Serve a similar snapshot when the exact key misses and signatures
    /// agree closely enough.
    pub dom_signature_fallback: bool,
}
