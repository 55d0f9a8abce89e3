// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sources of training messages.
//!
//! The external import format is a JSON array of objects
//! `{ "message": string, "attachments"?: [string] }`. The engine only
//! consumes the message text; attachments are carried through for the
//! adapter's own bookkeeping. [`JsonImportSource`] walks the array one
//! element at a time so an import file never has to fit in memory.

use std::fs::File;
use std::io::{BufReader, Bytes, Read};
use std::path::Path;

use serde::Deserialize;

use crate::core::error::{MarkovError, MarkovResult};

/// One ingested message, before tokenization.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrainingMessage {
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl TrainingMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attachments: Vec::new(),
        }
    }
}

/// Streaming reader over the JSON import array.
///
/// Elements are scanned out of the byte stream with a small depth
/// tracker (strings and escapes respected) and deserialized one at a
/// time, so memory use is bounded by the largest single element.
pub struct JsonImportSource<R: Read> {
    bytes: Bytes<BufReader<R>>,
    started: bool,
    finished: bool,
}

impl JsonImportSource<File> {
    pub fn from_path(path: &Path) -> MarkovResult<Self> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read> JsonImportSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            bytes: BufReader::new(reader).bytes(),
            started: false,
            finished: false,
        }
    }

    fn next_byte(&mut self) -> MarkovResult<Option<u8>> {
        match self.bytes.next() {
            Some(Ok(b)) => Ok(Some(b)),
            Some(Err(e)) => Err(MarkovError::Io(e)),
            None => Ok(None),
        }
    }

    fn next_significant(&mut self) -> MarkovResult<Option<u8>> {
        loop {
            match self.next_byte()? {
                Some(b) if b.is_ascii_whitespace() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Read the bytes of the next array element, or `None` at the
    /// closing bracket.
    fn next_element(&mut self) -> MarkovResult<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        if !self.started {
            match self.next_significant()? {
                Some(b'[') => self.started = true,
                Some(other) => {
                    return Err(MarkovError::invalid_input(format!(
                        "import must be a JSON array, found '{}'",
                        other as char
                    )))
                }
                None => {
                    return Err(MarkovError::invalid_input(
                        "import stream is empty, expected a JSON array",
                    ))
                }
            }
        }

        let first = loop {
            match self.next_significant()? {
                Some(b',') => continue,
                Some(b']') => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(b'{') => break b'{',
                Some(other) => {
                    return Err(MarkovError::invalid_input(format!(
                        "import elements must be objects, found '{}'",
                        other as char
                    )))
                }
                None => {
                    return Err(MarkovError::invalid_input(
                        "import stream ended before the array was closed",
                    ))
                }
            }
        };

        let mut element = vec![first];
        let mut depth = 1usize;
        let mut in_string = false;
        let mut escaped = false;

        while depth > 0 {
            let byte = self.next_byte()?.ok_or_else(|| {
                MarkovError::invalid_input("import stream ended inside an element")
            })?;
            element.push(byte);

            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => depth -= 1,
                _ => {}
            }
        }

        Ok(Some(element))
    }
}

impl<R: Read> Iterator for JsonImportSource<R> {
    type Item = MarkovResult<TrainingMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_element() {
            Ok(Some(bytes)) => Some(serde_json::from_slice(&bytes).map_err(|e| {
                MarkovError::invalid_input(format!("malformed import element: {e}"))
            })),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Wrap plain strings as an in-memory message source.
pub fn messages<I, S>(texts: I) -> impl Iterator<Item = MarkovResult<TrainingMessage>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    texts
        .into_iter()
        .map(|text| Ok(TrainingMessage::new(text)))
}
