//! Manifest decoding
//!
//! Turns a rendered multi-document manifest (YAML documents separated by
//! `---`, or a stream of JSON objects) into an ordered list of
//! [`ManifestObject`]s. Decoding is atomic: one malformed document fails the
//! whole call and no objects are returned.

use std::io::{BufRead, BufReader, Read};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::object::ManifestObject;
use crate::error::{Error, Result};

/// Default read buffer; large enough for big CRDs in a single document
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Streaming decoder for rendered manifests
#[derive(Debug)]
pub struct ManifestDecoder<R> {
    reader: BufReader<R>,
}

impl<R: Read> ManifestDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(reader: R, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size.max(1), reader),
        }
    }

    /// Decode every document in the stream
    ///
    /// Reaching end of input is not an error, even when no documents were
    /// found. Empty documents (e.g. a trailing `---`) are skipped and do not
    /// count towards document indices.
    pub fn decode(mut self) -> Result<Vec<ManifestObject>> {
        let values = if self.starts_with_json()? {
            decode_json_stream(self.reader)?
        } else {
            decode_yaml_stream(self.reader)?
        };

        let mut objects = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let obj = ManifestObject::from_value(value)
                .map_err(|message| Error::ManifestDecode { index, message })?;
            objects.push(obj);
        }
        debug!(count = objects.len(), "Decoded manifest");
        Ok(objects)
    }

    /// Peek at the first non-whitespace byte without consuming it
    fn starts_with_json(&mut self) -> Result<bool> {
        loop {
            let buf = self.reader.fill_buf().map_err(|e| Error::ManifestDecode {
                index: 0,
                message: e.to_string(),
            })?;
            if buf.is_empty() {
                return Ok(false);
            }
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(pos) => {
                    let first = buf[pos];
                    self.reader.consume(pos);
                    return Ok(first == b'{');
                }
                None => {
                    let len = buf.len();
                    self.reader.consume(len);
                }
            }
        }
    }
}

fn decode_yaml_stream<R: Read>(reader: R) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    for document in serde_yaml::Deserializer::from_reader(reader) {
        let index = values.len();
        let value = Value::deserialize(document).map_err(|e| Error::ManifestDecode {
            index,
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        values.push(value);
    }
    Ok(values)
}

fn decode_json_stream<R: Read>(reader: R) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    for value in serde_json::Deserializer::from_reader(reader).into_iter::<Value>() {
        let index = values.len();
        let value = value.map_err(|e| Error::ManifestDecode {
            index,
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        values.push(value);
    }
    Ok(values)
}

/// Decode a manifest held in memory
pub fn decode_manifest(raw: &str, buffer_size: usize) -> Result<Vec<ManifestObject>> {
    ManifestDecoder::with_buffer_size(raw.as_bytes(), buffer_size).decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(name: &str) -> String {
        format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  key: value\n")
    }

    #[test]
    fn test_decodes_documents_in_order() {
        let raw = (0..5)
            .map(|i| config_map(&format!("cm-{i}")))
            .collect::<Vec<_>>()
            .join("---\n");
        let objects = decode_manifest(&raw, DEFAULT_BUFFER_SIZE).unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["cm-0", "cm-1", "cm-2", "cm-3", "cm-4"]);
    }

    #[test]
    fn test_empty_input_is_not_an_error() {
        assert!(decode_manifest("", DEFAULT_BUFFER_SIZE).unwrap().is_empty());
        assert!(decode_manifest("  \n\n", DEFAULT_BUFFER_SIZE)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_trailing_separator_and_whitespace_tolerated() {
        let raw = format!("---\n{}---\n\n", config_map("only"));
        let objects = decode_manifest(&raw, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_truncated_document_fails_whole_decode() {
        let raw = format!(
            "{}---\napiVersion: v1\nkind: ConfigMap\nmetadata: {{name: \"trunc",
            config_map("first")
        );
        let err = decode_manifest(&raw, DEFAULT_BUFFER_SIZE).unwrap_err();
        assert!(matches!(err, Error::ManifestDecode { .. }));
    }

    #[test]
    fn test_document_without_kind_reports_index() {
        let raw = format!(
            "{}---\napiVersion: v1\nmetadata:\n  name: broken\n",
            config_map("first")
        );
        match decode_manifest(&raw, DEFAULT_BUFFER_SIZE) {
            Err(Error::ManifestDecode { index, message }) => {
                assert_eq!(index, 1);
                assert!(message.contains("kind"));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_json_object_stream() {
        let raw = r#"
            {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}
            {"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "b"}}
        "#;
        let objects = decode_manifest(raw, 16).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].gvk.kind, "Secret");
    }

    #[test]
    fn test_small_buffer_still_decodes_large_document() {
        let big_value = "x".repeat(10_000);
        let raw = format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: big\ndata:\n  blob: {big_value}\n"
        );
        let objects = decode_manifest(&raw, 8).unwrap();
        assert_eq!(objects[0].payload()["data"]["blob"].as_str().unwrap().len(), 10_000);
    }
}
