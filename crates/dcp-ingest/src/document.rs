//! Repository documents and fan-out duplication
//!
//! A [`Document`] is what a repository connector fetched: metadata fields
//! plus a binary body. The body is either an async stream (read once) or a
//! spooled byte buffer (cheaply cloneable). When a pipeline fan-out must hand
//! the same document to several sibling subtrees, a [`DocumentFactory`]
//! spools the stream a single time and then yields as many independent
//! byte-backed views as needed.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

/// Binary content of a document.
pub enum DocumentBody {
    /// Fully buffered content; cloning is cheap and yields an independent view.
    Bytes(Bytes),
    /// Streaming content; may only be read once.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for DocumentBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentBody::Bytes(b) => write!(f, "DocumentBody::Bytes({} bytes)", b.len()),
            DocumentBody::Stream(_) => write!(f, "DocumentBody::Stream"),
        }
    }
}

/// A document flowing through the transformation/output pipeline.
#[derive(Debug)]
pub struct Document {
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// Stamped by the coordinator when an ingest attempt starts.
    pub indexing_date: Option<DateTime<Utc>>,
    /// Named metadata fields; a field may carry several values.
    pub fields: HashMap<String, Vec<String>>,
    /// Declared body length in bytes.
    pub binary_length: u64,
    body: DocumentBody,
}

impl Document {
    /// Build a document over an already-buffered body.
    pub fn from_bytes(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Document {
            mime_type: None,
            file_name: None,
            created: None,
            modified: None,
            indexing_date: None,
            fields: HashMap::new(),
            binary_length: body.len() as u64,
            body: DocumentBody::Bytes(body),
        }
    }

    /// Build a document over a stream of `binary_length` bytes.
    pub fn from_stream(
        stream: Box<dyn AsyncRead + Send + Unpin>,
        binary_length: u64,
    ) -> Self {
        Document {
            mime_type: None,
            file_name: None,
            created: None,
            modified: None,
            indexing_date: None,
            fields: HashMap::new(),
            binary_length,
            body: DocumentBody::Stream(stream),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.fields.insert(name.into(), values);
        self
    }

    pub fn body(&self) -> &DocumentBody {
        &self.body
    }

    /// Consume the document and return its full body, reading the stream to
    /// the end if it was not already buffered.
    pub async fn into_body_bytes(self) -> Result<Bytes> {
        match self.body {
            DocumentBody::Bytes(b) => Ok(b),
            DocumentBody::Stream(mut stream) => {
                let mut buf = Vec::with_capacity(self.binary_length as usize);
                stream.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            },
        }
    }
}

/// Produces independent copies of one underlying document.
///
/// Construction spools a streaming body into memory exactly once; every
/// [`DocumentFactory::document`] call afterwards is a cheap clone. A fan-out
/// with a single active child skips the factory entirely and passes the
/// original document through untouched.
pub struct DocumentFactory {
    mime_type: Option<String>,
    file_name: Option<String>,
    created: Option<DateTime<Utc>>,
    modified: Option<DateTime<Utc>>,
    indexing_date: Option<DateTime<Utc>>,
    fields: HashMap<String, Vec<String>>,
    body: Bytes,
}

impl DocumentFactory {
    pub async fn new(document: Document) -> Result<Self> {
        let mime_type = document.mime_type.clone();
        let file_name = document.file_name.clone();
        let created = document.created;
        let modified = document.modified;
        let indexing_date = document.indexing_date;
        let fields = document.fields.clone();
        let body = document.into_body_bytes().await?;
        Ok(DocumentFactory {
            mime_type,
            file_name,
            created,
            modified,
            indexing_date,
            fields,
            body,
        })
    }

    /// A fresh, fully independent view of the underlying document.
    pub fn document(&self) -> Document {
        Document {
            mime_type: self.mime_type.clone(),
            file_name: self.file_name.clone(),
            created: self.created,
            modified: self.modified,
            indexing_date: self.indexing_date,
            fields: self.fields.clone(),
            binary_length: self.body.len() as u64,
            body: DocumentBody::Bytes(self.body.clone()),
        }
    }
}
