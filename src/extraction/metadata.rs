//! Parser for the line-oriented metadata returned by the worker's `/meta` endpoint.
//!
//! Each line is a CSV-ish pair of double-quoted strings:
//!
//! ```text
//! "Content-Type","application/msword"
//! "Creation-Date","2013-05-03T07:46:00Z"
//! "X-Parsed-By","org.apache.tika.parser.ParserDecorator$1","org.apache.tika.parser.microsoft.OfficeParser"
//! ```
//!
//! Well-known keys land in typed fields; everything else is kept verbatim in
//! [`Metadata::data`]. Malformed content never fails the parse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const SEPARATOR: &str = "\",\"";

/// Structured metadata extracted from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Document author (`Author`).
    pub author: String,
    /// MIME type detected by the worker (`Content-Type`).
    #[serde(rename = "content-type")]
    pub content_type: String,
    /// Document title (`title`).
    pub title: String,
    /// Every other key reported by the worker.
    pub data: BTreeMap<String, String>,
    /// Creation timestamp (`Creation-Date`), when present and well formed.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
}

/// Non-fatal problem found while scanning metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarning {
    /// Line without a `","` separator; it was skipped.
    MissingSeparator {
        /// Raw line content.
        line: String,
    },
    /// `Creation-Date` value that is not an RFC 3339 timestamp; `created` stays unset.
    InvalidCreationDate {
        /// Offending value.
        value: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Result of scanning a metadata response.
#[derive(Debug, Clone, Default)]
pub struct ParsedMetadata {
    /// Structured metadata.
    pub metadata: Metadata,
    /// Problems that were tolerated during the scan.
    pub warnings: Vec<ParseWarning>,
}

/// Scan `reader` line by line and build [`Metadata`].
///
/// Only I/O failures of the underlying reader are reported as errors.
pub fn read_metadata<R: BufRead>(reader: R) -> std::io::Result<ParsedMetadata> {
    let mut parsed = ParsedMetadata::default();

    for line in reader.split(b'\n') {
        let line = line?;
        let raw = String::from_utf8_lossy(&line);
        let trimmed = raw
            .trim_end_matches(['"', '\r', '\n'])
            .trim_start_matches('"');

        let Some((key, value)) = trimmed.split_once(SEPARATOR) else {
            tracing::warn!(line = %raw, "no field separator");
            parsed.warnings.push(ParseWarning::MissingSeparator {
                line: raw.into_owned(),
            });
            continue;
        };
        let value = value.replace('"', "");
        tracing::trace!(key, value = %value, "scan");

        let metadata = &mut parsed.metadata;
        match key {
            "Content-Type" => metadata.content_type = value,
            "Author" => metadata.author = value,
            "title" => metadata.title = value,
            "Creation-Date" => match OffsetDateTime::parse(&value, &Rfc3339) {
                Ok(created) => metadata.created = Some(created),
                Err(err) => {
                    tracing::warn!(text = %value, error = %err, "parse Creation-Date");
                    parsed.warnings.push(ParseWarning::InvalidCreationDate {
                        value,
                        reason: err.to_string(),
                    });
                }
            },
            _ => {
                metadata.data.insert(key.to_string(), value);
            }
        }
    }

    Ok(parsed)
}
