//! Log batch encoders and compressors used by the log upload.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value;
use thiserror::Error;
use updater_core::{CompressionType, EncodingConfig, EncodingType};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to encode log line: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to compress log batch: {0}")]
    Compress(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEncoder {
    /// One JSON document per line. Lines that are not JSON are sent as strings.
    Json,
    /// Each line trimmed and followed by the delimiter.
    Raw { delimiter: String },
}

impl LogEncoder {
    pub fn from_config(config: &EncodingConfig) -> Self {
        match config.kind {
            EncodingType::Json => LogEncoder::Json,
            EncodingType::Raw => LogEncoder::Raw {
                delimiter: unescape(
                    config
                        .opts
                        .as_ref()
                        .map(|o| o.delimiter.as_str())
                        .unwrap_or_default(),
                ),
            },
        }
    }

    pub fn encode(&self, lines: &[String]) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        match self {
            LogEncoder::Json => {
                for line in lines {
                    let doc = serde_json::from_str::<Value>(line)
                        .unwrap_or_else(|_| Value::String(line.clone()));
                    serde_json::to_writer(&mut out, &doc)?;
                    out.push(b'\n');
                }
            }
            LogEncoder::Raw { delimiter } => {
                for line in lines {
                    out.extend_from_slice(line.trim().as_bytes());
                    out.extend_from_slice(delimiter.as_bytes());
                }
            }
        }
        Ok(out)
    }
}

/// Turns the escaped `\t`, `\r` and `\n` of a configured delimiter into
/// the characters they name.
fn unescape(raw: &str) -> String {
    raw.replace("\\t", "\t")
        .replace("\\r", "\r")
        .replace("\\n", "\n")
}

pub fn compress(kind: CompressionType, data: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
    match kind {
        CompressionType::None => Ok(data),
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Encode then compress a batch of log lines.
pub fn encode_batch(
    lines: &[String],
    encoding: &EncodingConfig,
    compression: CompressionType,
) -> Result<Vec<u8>, EncodeError> {
    compress(compression, LogEncoder::from_config(encoding).encode(lines)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use updater_core::EncodingOptions;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn json_lines_are_reencoded() {
        let out = LogEncoder::Json
            .encode(&lines(&[r#"{ "level": "INFO", "n": 1 }"#, "not json"]))
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"level\":\"INFO\",\"n\":1}\n\"not json\"\n"
        );
    }

    #[test]
    fn raw_lines_use_unescaped_delimiter() {
        let config = EncodingConfig {
            kind: EncodingType::Raw,
            opts: Some(EncodingOptions {
                delimiter: "\\t|\\n".into(),
            }),
        };
        let encoder = LogEncoder::from_config(&config);
        assert_eq!(
            encoder,
            LogEncoder::Raw {
                delimiter: "\t|\n".into()
            }
        );
        let out = encoder.encode(&lines(&["  a ", "b\n"])).unwrap();
        assert_eq!(out, b"a\t|\nb\t|\n");
    }

    #[test]
    fn raw_without_options_has_no_delimiter() {
        let config = EncodingConfig {
            kind: EncodingType::Raw,
            opts: None,
        };
        let out = LogEncoder::from_config(&config)
            .encode(&lines(&["a", "b"]))
            .unwrap();
        assert_eq!(out, b"ab");
    }

    #[test]
    fn gzip_batch_decompresses_to_encoded_lines() {
        let batch = encode_batch(
            &lines(&["one", "two"]),
            &EncodingConfig {
                kind: EncodingType::Raw,
                opts: Some(EncodingOptions {
                    delimiter: "\\n".into(),
                }),
            },
            CompressionType::Gzip,
        )
        .unwrap();
        let mut decoded = String::new();
        GzDecoder::new(batch.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "one\ntwo\n");
    }

    #[test]
    fn no_compression_passes_through() {
        assert_eq!(compress(CompressionType::None, b"abc".to_vec()).unwrap(), b"abc");
    }
}
