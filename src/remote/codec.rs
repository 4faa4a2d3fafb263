//! Envelope batch wire format: a JSON array of envelopes, optionally
//! compressed, announced through `Content-Encoding`.

use std::fmt;
use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::RemoteEnvelope;

/// Body compression for remote batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl Compression {
    /// Returns the Content-Encoding header value for the algorithm.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    /// Inverse of `content_encoding`.
    pub fn from_content_encoding(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("identity") => Ok(Self::None),
            Some("gzip") => Ok(Self::Gzip),
            Some("zstd") => Ok(Self::Zstd),
            Some("deflate") => Ok(Self::Zlib),
            Some("snappy") => Ok(Self::Snappy),
            Some(other) => bail!("unsupported content encoding: {other}"),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Zlib => "zlib",
            Self::Snappy => "snappy",
        };
        f.write_str(name)
    }
}

/// Serializes and compresses a batch.
pub fn encode_batch(envelopes: &[RemoteEnvelope], compression: Compression) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(envelopes).context("serializing envelope batch")?;
    compress(&raw, compression).context("compressing envelope batch")
}

/// Upper bound on a batch after decompression.
pub const MAX_DECODED_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// Decompresses and parses a batch. Bodies that inflate past
/// [`MAX_DECODED_BATCH_BYTES`] are rejected before parsing.
pub fn decode_batch(body: &[u8], compression: Compression) -> Result<Vec<RemoteEnvelope>> {
    let raw = decompress(body, compression, MAX_DECODED_BATCH_BYTES)
        .context("decompressing envelope batch")?;
    serde_json::from_slice(&raw).context("parsing envelope batch")
}

fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::write::GzEncoder;

            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        Compression::Zstd => zstd::encode_all(data, 0).context("zstd encode"),
        Compression::Zlib => {
            use flate2::write::ZlibEncoder;

            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).context("zlib write")?;
            encoder.finish().context("zlib finish")
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy encode"),
    }
}

fn decompress(data: &[u8], compression: Compression, limit: usize) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            if data.len() > limit {
                bail!("batch of {} bytes exceeds {limit} bytes", data.len());
            }
            Ok(data.to_vec())
        }
        Compression::Gzip => read_limited(flate2::read::GzDecoder::new(data), limit).context("gzip read"),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(data).context("zstd decoder")?;
            read_limited(decoder, limit).context("zstd read")
        }
        Compression::Zlib => read_limited(flate2::read::ZlibDecoder::new(data), limit).context("zlib read"),
        Compression::Snappy => {
            let len = snap::raw::decompress_len(data).context("snappy header")?;
            if len > limit {
                bail!("batch inflates to {len} bytes, limit is {limit}");
            }
            snap::raw::Decoder::new()
                .decompress_vec(data)
                .context("snappy decode")
        }
    }
}

/// Reads at most `limit` bytes, failing if the stream has more.
fn read_limited(reader: impl Read, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > limit {
        bail!("batch inflates past {limit} bytes");
    }
    Ok(out)
}
