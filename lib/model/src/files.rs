// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Files crossing the model boundary.
//!
//! Uploads arrive as [`FileField`]s carrying a stream. The wrapper stages each one into a
//! temporary file and hands the model an [`UploadedFile`] pointing at it. The returned
//! [`TempPath`] guard deletes the file when the model call is over, whatever its outcome.
//! Files a model produces travel back as [`ReturnedFile`]s, owned by the receiver.

use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};

const UPLOAD_PREFIX: &str = "modelserve-upload-";

/// A staged upload, as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Argument the file was sent as
    pub name: String,
    /// Local path of the temporary copy
    pub filename: PathBuf,
    pub content_type: Option<String>,
    pub original_filename: Option<String>,
}

impl UploadedFile {
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.filename)
    }
}

/// A file produced by the model. Whoever receives it reads it and removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedFile {
    pub name: String,
    pub filename: PathBuf,
    pub content_type: Option<String>,
    pub original_filename: Option<String>,
}

impl ReturnedFile {
    /// Read the content and delete the file.
    pub async fn take(self) -> std::io::Result<Vec<u8>> {
        let data = tokio::fs::read(&self.filename).await?;
        if let Err(err) = tokio::fs::remove_file(&self.filename).await {
            tracing::warn!(path = %self.filename.display(), error = %err, "Failed to remove returned file");
        }
        Ok(data)
    }

    /// Delete the file without reading it.
    pub fn discard(self) {
        if let Err(err) = std::fs::remove_file(&self.filename) {
            tracing::warn!(path = %self.filename.display(), error = %err, "Failed to remove returned file");
        }
    }
}

/// An upload as received by the HTTP layer, before staging.
pub struct FileField {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl fmt::Debug for FileField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileField")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl FileField {
    pub fn new(
        name: impl Into<String>,
        filename: Option<String>,
        content_type: Option<String>,
        reader: impl AsyncRead + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            filename,
            content_type,
            reader: Box::pin(reader),
        }
    }

    pub fn from_bytes(
        name: impl Into<String>,
        filename: Option<String>,
        content_type: Option<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(name, filename, content_type, Cursor::new(data.into()))
    }

    /// Copy the stream into a new temporary file.
    pub async fn stage(mut self) -> std::io::Result<(UploadedFile, TempPath)> {
        let (file, path) = tempfile::Builder::new()
            .prefix(UPLOAD_PREFIX)
            .tempfile()?
            .into_parts();

        let mut out = tokio::fs::File::from_std(file);
        let written = tokio::io::copy(&mut self.reader, &mut out).await?;
        out.flush().await?;
        tracing::debug!(
            argument = %self.name,
            bytes = written,
            path = %path.display(),
            "Staged upload"
        );

        let upload = UploadedFile {
            name: self.name,
            filename: path.to_path_buf(),
            content_type: self.content_type,
            original_filename: self.filename,
        };
        Ok((upload, path))
    }
}
