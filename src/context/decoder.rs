//! Incremental request body decoding.
//!
//! One [`BodyDecoder`] exists per POST/PUT request. It is fed body chunks as
//! they arrive and never buffers without bound: urlencoded forms are capped,
//! and raw bodies and uploaded files go through a [`SpillBuffer`] that moves
//! to a temporary file once it crosses the spill threshold.

use crate::fault::DecodeError;
use crate::runtime_config::DecoderConfig;
use crate::stats::EngineStats;
use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Upper bound on one multipart part's header block.
const MAX_PART_HEADER_BYTES: usize = 8 * 1024;
const MAX_PART_HEADERS: usize = 16;

/// Bytes kept in memory up to a threshold, then in a temporary file.
///
/// The temporary file is deleted when the buffer is dropped.
pub struct SpillBuffer {
    threshold: usize,
    temp_dir: Option<PathBuf>,
    memory: BytesMut,
    file: Option<NamedTempFile>,
    len: u64,
    stats: Arc<EngineStats>,
}

impl SpillBuffer {
    #[must_use]
    pub fn new(config: &DecoderConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            threshold: config.spill_threshold,
            temp_dir: config.temp_dir.clone(),
            memory: BytesMut::new(),
            file: None,
            len: 0,
            stats,
        }
    }

    pub fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.file.is_none() && self.memory.len() + chunk.len() > self.threshold {
            self.spill()?;
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk)?,
            None => self.memory.extend_from_slice(chunk),
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("brrte-upload-");
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(&self.memory)?;
        self.memory.clear();
        self.stats.record_spill_created();
        debug!(
            path = %file.path().display(),
            threshold = self.threshold,
            "Upload spilled to temporary file"
        );
        self.file = Some(file);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Path of the temporary file, once spilled.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(NamedTempFile::path)
    }

    /// A fresh reader over everything written so far.
    pub fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.file {
            Some(file) => {
                let handle: File = file.reopen()?;
                Ok(Box::new(handle))
            }
            None => Ok(Box::new(Bytes::copy_from_slice(&self.memory).reader())),
        }
    }

    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Drop for SpillBuffer {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary upload");
            }
            self.stats.record_spill_removed();
        }
    }
}

/// A file uploaded through a multipart form.
pub struct FileItem {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    data: SpillBuffer,
}

impl FileItem {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        !self.data.is_spilled()
    }

    pub fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        self.data.reader()
    }

    pub fn bytes(&self) -> io::Result<Vec<u8>> {
        self.data.to_vec()
    }

    /// Location on disk, if the upload was large enough to spill.
    #[must_use]
    pub fn temp_path(&self) -> Option<&Path> {
        self.data.path()
    }
}

/// Form fields decoded from the body.
pub type Attributes = Vec<(String, String)>;

enum Part {
    Field { name: String, value: BytesMut },
    File(FileItem),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultipartState {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Done,
}

/// Streaming `multipart/form-data` parser.
struct MultipartParser {
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: MultipartState,
    part: Option<Part>,
    max_field_bytes: usize,
}

impl MultipartParser {
    fn new(boundary: &str, max_field_bytes: usize) -> Self {
        let dash_boundary = format!("--{boundary}").into_bytes();
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&dash_boundary);
        Self {
            dash_boundary,
            delimiter,
            buf: BytesMut::new(),
            state: MultipartState::Preamble,
            part: None,
            max_field_bytes,
        }
    }

    fn offer(
        &mut self,
        chunk: &[u8],
        config: &DecoderConfig,
        stats: &Arc<EngineStats>,
        attributes: &mut Attributes,
        files: &mut Vec<FileItem>,
    ) -> Result<(), DecodeError> {
        self.buf.extend_from_slice(chunk);
        loop {
            match self.state {
                MultipartState::Preamble => {
                    match memmem::find(&self.buf, &self.dash_boundary) {
                        Some(idx) => {
                            self.buf.advance(idx + self.dash_boundary.len());
                            self.state = MultipartState::AfterDelimiter;
                        }
                        None => {
                            let keep = self.dash_boundary.len().saturating_sub(1);
                            let drop_len = self.buf.len().saturating_sub(keep);
                            self.buf.advance(drop_len);
                            return Ok(());
                        }
                    }
                }
                MultipartState::AfterDelimiter => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if self.buf.starts_with(b"--") {
                        self.buf.clear();
                        self.state = MultipartState::Done;
                    } else if self.buf.starts_with(b"\r\n") {
                        self.buf.advance(2);
                        self.state = MultipartState::Headers;
                    } else {
                        return Err(DecodeError::Multipart(
                            "unexpected bytes after boundary".to_string(),
                        ));
                    }
                }
                MultipartState::Headers => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
                    match httparse::parse_headers(&self.buf, &mut headers) {
                        Ok(httparse::Status::Complete((consumed, parsed))) => {
                            let part = Self::start_part(parsed, config, stats)?;
                            self.part = Some(part);
                            self.buf.advance(consumed);
                            self.state = MultipartState::Body;
                        }
                        Ok(httparse::Status::Partial) => {
                            if self.buf.len() > MAX_PART_HEADER_BYTES {
                                return Err(DecodeError::Multipart(
                                    "part headers too large".to_string(),
                                ));
                            }
                            return Ok(());
                        }
                        Err(e) => return Err(DecodeError::Multipart(e.to_string())),
                    }
                }
                MultipartState::Body => match memmem::find(&self.buf, &self.delimiter) {
                    Some(idx) => {
                        let data = self.buf.split_to(idx);
                        self.append_to_part(&data)?;
                        self.buf.advance(self.delimiter.len());
                        self.finish_part(attributes, files);
                        self.state = MultipartState::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len().saturating_sub(1);
                        let take = self.buf.len().saturating_sub(keep);
                        if take > 0 {
                            let data = self.buf.split_to(take);
                            self.append_to_part(&data)?;
                        }
                        return Ok(());
                    }
                },
                MultipartState::Done => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    fn start_part(
        headers: &[httparse::Header<'_>],
        config: &DecoderConfig,
        stats: &Arc<EngineStats>,
    ) -> Result<Part, DecodeError> {
        let mut name = None;
        let mut file_name = None;
        let mut content_type = None;
        for header in headers {
            let value = String::from_utf8_lossy(header.value);
            if header.name.eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    if let Some((key, val)) = param.trim().split_once('=') {
                        let val = val.trim().trim_matches('"').to_string();
                        match key.trim() {
                            "name" => name = Some(val),
                            "filename" => file_name = Some(val),
                            _ => {}
                        }
                    }
                }
            } else if header.name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }
        let name = name.ok_or_else(|| {
            DecodeError::Multipart("part without a content-disposition name".to_string())
        })?;
        Ok(match file_name {
            Some(file_name) => Part::File(FileItem {
                field: name,
                file_name,
                content_type,
                data: SpillBuffer::new(config, Arc::clone(stats)),
            }),
            None => Part::Field {
                name,
                value: BytesMut::new(),
            },
        })
    }

    fn append_to_part(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        match self.part.as_mut() {
            Some(Part::Field { value, .. }) => {
                if value.len() + data.len() > self.max_field_bytes {
                    return Err(DecodeError::FormTooLarge {
                        limit: self.max_field_bytes,
                    });
                }
                value.extend_from_slice(data);
            }
            Some(Part::File(item)) => item.data.write(data)?,
            None => {}
        }
        Ok(())
    }

    fn finish_part(&mut self, attributes: &mut Attributes, files: &mut Vec<FileItem>) {
        match self.part.take() {
            Some(Part::Field { name, value }) => {
                attributes.push((name, String::from_utf8_lossy(&value).into_owned()));
            }
            Some(Part::File(item)) => files.push(item),
            None => {}
        }
    }

    fn is_done(&self) -> bool {
        self.state == MultipartState::Done
    }
}

enum DecoderKind {
    Form(BytesMut),
    Multipart(Box<MultipartParser>),
    Raw(SpillBuffer),
}

/// Per-request incremental body decoder.
pub struct BodyDecoder {
    kind: DecoderKind,
    config: DecoderConfig,
    attributes: Attributes,
    files: Vec<FileItem>,
    finished: bool,
    stats: Arc<EngineStats>,
    destroyed: bool,
}

impl BodyDecoder {
    /// Pick a decoding strategy from the request's `Content-Type` header.
    pub fn new(
        content_type: Option<&str>,
        config: &DecoderConfig,
        stats: Arc<EngineStats>,
    ) -> Result<Self, DecodeError> {
        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase());
        let kind = match mime.as_deref() {
            Some("application/x-www-form-urlencoded") => DecoderKind::Form(BytesMut::new()),
            Some("multipart/form-data") => {
                let boundary = content_type
                    .and_then(boundary_param)
                    .ok_or(DecodeError::MissingBoundary)?;
                DecoderKind::Multipart(Box::new(MultipartParser::new(
                    &boundary,
                    config.max_form_bytes,
                )))
            }
            _ => DecoderKind::Raw(SpillBuffer::new(config, Arc::clone(&stats))),
        };
        stats.record_decoder_created();
        Ok(Self {
            kind,
            config: config.clone(),
            attributes: Vec::new(),
            files: Vec::new(),
            finished: false,
            stats,
            destroyed: false,
        })
    }

    /// Feed the next body chunk.
    pub fn offer(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        match &mut self.kind {
            DecoderKind::Form(buf) => {
                if buf.len() + chunk.len() > self.config.max_form_bytes {
                    return Err(DecodeError::FormTooLarge {
                        limit: self.config.max_form_bytes,
                    });
                }
                buf.extend_from_slice(chunk);
            }
            DecoderKind::Multipart(parser) => parser.offer(
                chunk,
                &self.config,
                &self.stats,
                &mut self.attributes,
                &mut self.files,
            )?,
            DecoderKind::Raw(buffer) => buffer.write(chunk)?,
        }
        Ok(())
    }

    /// Mark the body complete.
    pub fn finish(&mut self) -> Result<(), DecodeError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        match &mut self.kind {
            DecoderKind::Form(buf) => {
                self.attributes = url::form_urlencoded::parse(&buf[..])
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                buf.clear();
                Ok(())
            }
            DecoderKind::Multipart(parser) if !parser.is_done() => Err(DecodeError::Multipart(
                "body ended before the closing boundary".to_string(),
            )),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    #[must_use]
    pub fn files(&self) -> &[FileItem] {
        &self.files
    }

    /// True for bodies that are neither urlencoded nor multipart.
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self.kind, DecoderKind::Raw(_))
    }

    /// Reader over a raw body; `None` for form bodies.
    pub fn raw_reader(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        match &self.kind {
            DecoderKind::Raw(buffer) => buffer.reader().map(Some),
            _ => Ok(None),
        }
    }

    #[must_use]
    pub fn raw_len(&self) -> u64 {
        match &self.kind {
            DecoderKind::Raw(buffer) => buffer.len(),
            _ => 0,
        }
    }

    /// Release everything this decoder holds, temporary files included.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.files.clear();
        self.attributes.clear();
        // Dropping the raw buffer removes its temporary file.
        self.kind = DecoderKind::Form(BytesMut::new());
        self.stats.record_decoder_destroyed();
    }
}

impl Drop for BodyDecoder {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// `boundary` parameter of a multipart content type.
fn boundary_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}
