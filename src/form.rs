//! Form body decoders.
//!
//! `application/x-www-form-urlencoded` bodies are buffered and decoded at the
//! end. `multipart/form-data` bodies are decoded as chunks arrive: plain
//! fields are kept in memory and file parts are spooled to temporary files,
//! so an upload never has to fit in memory.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use memchr::memmem;
use tempfile::NamedTempFile;

use crate::body::{BodyDecoder, RequestBody};
use crate::error::ParamKind;
use crate::request::Params;

/// Upper bound for the header block of a single part.
const MAX_PART_HEADER_SIZE: usize = 8 * 1024;

/// Decoded form fields and uploaded files.
#[derive(Debug, Clone)]
pub struct FormParams {
    fields: Params,
    files: Vec<FileUpload>,
}

impl FormParams {
    fn new(fields: Vec<(String, String)>, files: Vec<FileUpload>) -> Self {
        FormParams {
            fields: Params::from_entries(ParamKind::Form, fields),
            files,
        }
    }

    /// First value of a field. For a file part this is the client filename.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).or_else(|| {
            self.files
                .iter()
                .find(|f| f.name == name)
                .and_then(|f| f.filename.as_deref())
        })
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields.get_all(name)
    }

    /// Plain (non-file) fields, with typed access.
    pub fn fields(&self) -> &Params {
        &self.fields
    }

    pub fn file(&self, name: &str) -> Option<&FileUpload> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn files(&self) -> &[FileUpload] {
        &self.files
    }

    /// Names of fields and file parts in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys = self.fields.keys();
        for file in &self.files {
            if !keys.contains(&file.name.as_str()) {
                keys.push(&file.name);
            }
        }
        keys
    }
}

/// A file part spooled to a temporary file.
///
/// The file is deleted once the last clone of the upload is dropped.
#[derive(Clone)]
pub struct FileUpload {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    size: u64,
    file: Arc<NamedTempFile>,
}

impl FileUpload {
    /// The form field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Reads the whole upload into memory.
    pub fn bytes(&self) -> io::Result<Vec<u8>> {
        std::fs::read(self.file.path())
    }

    /// Copies the upload to `to`.
    pub fn persist(&self, to: impl AsRef<Path>) -> io::Result<u64> {
        std::fs::copy(self.file.path(), to)
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish()
    }
}

/// Buffers an urlencoded body and decodes it once complete.
#[derive(Default)]
pub struct UrlEncodedDecoder {
    buf: Vec<u8>,
}

impl BodyDecoder for UrlEncodedDecoder {
    fn decode(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn release(&mut self) {
        self.buf = Vec::new();
    }

    fn finish(&mut self) -> RequestBody {
        let entries = form_urlencoded::parse(&self.buf)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        self.buf = Vec::new();
        RequestBody::Form(Arc::new(FormParams::new(entries, Vec::new())))
    }
}

enum State {
    /// Skipping bytes before the first delimiter.
    Preamble,
    /// Just consumed a delimiter; expecting `\r\n` or the closing `--`.
    Delimiter,
    Headers,
    Body(Part),
    /// After the closing delimiter.
    Done,
}

struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    sink: PartSink,
}

enum PartSink {
    Memory(Vec<u8>),
    File(NamedTempFile, u64),
}

/// Incremental `multipart/form-data` decoder.
pub struct MultipartDecoder {
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    state: State,
    fields: Vec<(String, String)>,
    files: Vec<FileUpload>,
    error: Option<String>,
}

impl MultipartDecoder {
    pub fn new(boundary: Option<&str>) -> Self {
        let mut decoder = MultipartDecoder {
            delimiter: Vec::new(),
            // The first delimiter is not preceded by a line break.
            buf: b"\r\n".to_vec(),
            state: State::Preamble,
            fields: Vec::new(),
            files: Vec::new(),
            error: None,
        };
        match boundary {
            Some(b) if !b.is_empty() => {
                decoder.delimiter = format!("\r\n--{}", b).into_bytes();
            }
            _ => decoder.error = Some("missing multipart boundary".to_string()),
        }
        decoder
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.buf = Vec::new();
        self.state = State::Done;
    }

    fn step(&mut self) -> io::Result<bool> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Preamble => match memmem::find(&self.buf, &self.delimiter) {
                Some(at) => {
                    self.buf.drain(..at + self.delimiter.len());
                    self.state = State::Delimiter;
                    Ok(true)
                }
                None => {
                    let keep = self.delimiter.len() - 1;
                    if self.buf.len() > keep {
                        self.buf.drain(..self.buf.len() - keep);
                    }
                    self.state = State::Preamble;
                    Ok(false)
                }
            },
            State::Delimiter => {
                if self.buf.len() < 2 {
                    self.state = State::Delimiter;
                    return Ok(false);
                }
                if self.buf.starts_with(b"--") {
                    self.buf = Vec::new();
                    self.state = State::Done;
                    Ok(false)
                } else if self.buf.starts_with(b"\r\n") {
                    self.buf.drain(..2);
                    self.state = State::Headers;
                    Ok(true)
                } else {
                    self.fail("malformed multipart delimiter");
                    Ok(false)
                }
            }
            State::Headers => {
                let end = if self.buf.starts_with(b"\r\n") {
                    Some((0, 2))
                } else {
                    memmem::find(&self.buf, b"\r\n\r\n").map(|at| (at, at + 4))
                };
                match end {
                    Some((at, consumed)) => {
                        let head = String::from_utf8_lossy(&self.buf[..at]).into_owned();
                        self.buf.drain(..consumed);
                        let part = parse_part_head(&head)?;
                        self.state = State::Body(part);
                        Ok(true)
                    }
                    None if self.buf.len() > MAX_PART_HEADER_SIZE => {
                        self.fail("multipart part headers too large");
                        Ok(false)
                    }
                    None => {
                        self.state = State::Headers;
                        Ok(false)
                    }
                }
            }
            State::Body(mut part) => match memmem::find(&self.buf, &self.delimiter) {
                Some(at) => {
                    part.write(&self.buf[..at])?;
                    self.buf.drain(..at + self.delimiter.len());
                    self.complete(part)?;
                    self.state = State::Delimiter;
                    Ok(true)
                }
                None => {
                    let keep = self.delimiter.len() - 1;
                    if self.buf.len() > keep {
                        let safe = self.buf.len() - keep;
                        part.write(&self.buf[..safe])?;
                        self.buf.drain(..safe);
                    }
                    self.state = State::Body(part);
                    Ok(false)
                }
            },
            State::Done => {
                self.buf.clear();
                Ok(false)
            }
        }
    }

    fn complete(&mut self, part: Part) -> io::Result<()> {
        match part.sink {
            PartSink::Memory(data) => {
                self.fields
                    .push((part.name, String::from_utf8_lossy(&data).into_owned()));
            }
            PartSink::File(mut file, size) => {
                file.flush()?;
                self.files.push(FileUpload {
                    name: part.name,
                    filename: part.filename,
                    content_type: part.content_type,
                    size,
                    file: Arc::new(file),
                });
            }
        }
        Ok(())
    }
}

impl Part {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.sink {
            PartSink::Memory(buf) => buf.extend_from_slice(data),
            PartSink::File(file, size) => {
                file.write_all(data)?;
                *size += data.len() as u64;
            }
        }
        Ok(())
    }
}

fn parse_part_head(head: &str) -> io::Result<Part> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in head.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                if let Some((k, v)) = param.split_once('=') {
                    let v = unquote(v.trim());
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(v),
                        "filename" => filename = Some(v),
                        _ => {}
                    }
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }

    let sink = if filename.is_some() {
        PartSink::File(NamedTempFile::new()?, 0)
    } else {
        PartSink::Memory(Vec::new())
    };

    Ok(Part {
        name: name.unwrap_or_default(),
        filename,
        content_type,
        sink,
    })
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

impl BodyDecoder for MultipartDecoder {
    fn decode(&mut self, chunk: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if matches!(self.state, State::Done) {
            return;
        }
        self.buf.extend_from_slice(chunk);
        loop {
            match self.step() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    self.fail(format!("failed to store multipart part: {}", e));
                    break;
                }
            }
        }
    }

    fn release(&mut self) {
        self.buf = Vec::new();
        self.state = State::Done;
        self.fields.clear();
        self.files.clear();
    }

    fn finish(&mut self) -> RequestBody {
        if let Some(reason) = self.error.take() {
            self.release();
            return RequestBody::Malformed(reason);
        }
        if !matches!(self.state, State::Done) {
            self.release();
            return RequestBody::Malformed("unexpected end of multipart body".to_string());
        }
        let fields = std::mem::take(&mut self.fields);
        let files = std::mem::take(&mut self.files);
        RequestBody::Form(Arc::new(FormParams::new(fields, files)))
    }
}
