//! Catalog binary framing: header, record framing, and the eager decoder.
//!
//! Wire format (little-endian throughout):
//!
//! ```text
//! header  : u8 version | u8 mode
//! record* : u16 keyLen | keyLen bytes (UTF-8 key)
//!           u16 metaLen | metaLen bytes (UTF-8 JSON of meta) -- 0 means no meta
//!           [mode == SINGLE_FILE only] u32 valueLen | valueLen bytes
//! ```

use std::io;

use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Mode;

pub const PROTOCOL_VERSION: u8 = 1;

const MAX_U16_LEN: usize = u16::MAX as usize;
const MAX_U32_LEN: usize = u32::MAX as usize;

/// Error surfaced while encoding a single field into the catalog framing.
#[derive(Debug, Snafu)]
pub enum CodecError {
    #[snafu(display("{field} for key {key:?} is {size} bytes, which exceeds the {limit}-byte limit"))]
    TooLarge {
        key: String,
        field: &'static str,
        size: usize,
        limit: usize,
    },
    #[snafu(display("catalog I/O error: {source}"))]
    Io { source: io::Error },
}

impl From<io::Error> for CodecError {
    fn from(source: io::Error) -> Self {
        CodecError::Io { source }
    }
}

/// A single record as it was parsed off the wire, before being turned into a `CacheEntry`.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub key: String,
    pub meta_bytes: Vec<u8>,
    pub inline_value: Option<Vec<u8>>,
}

/// Outcome of decoding a whole catalog file in one pass.
#[derive(Debug, Default)]
pub struct DecodeResult {
    pub mode: Option<Mode>,
    pub records: Vec<DecodedRecord>,
    /// True if the first byte did not match `PROTOCOL_VERSION`. A successful termination, not an
    /// error: the cache is treated as empty.
    pub version_mismatch: bool,
}

/// Encodes the two-byte catalog header.
pub fn encode_header(version: u8, mode: Mode) -> [u8; 2] {
    [version, mode.as_byte()]
}

/// Writes one record's framing to `sink`.
///
/// `value` is `Some` only in `SINGLE_FILE` mode; in `MULTI_FILE` mode no value frame is emitted
/// at all (not even a zero-length one).
pub async fn write_record<W>(
    sink: &mut W,
    key: &str,
    meta_bytes: Option<&[u8]>,
    value: Option<&[u8]>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let key_bytes = key.as_bytes();
    if key_bytes.len() > MAX_U16_LEN {
        return Err(CodecError::TooLarge {
            key: key.to_owned(),
            field: "key",
            size: key_bytes.len(),
            limit: MAX_U16_LEN,
        });
    }
    sink.write_u16_le(key_bytes.len() as u16).await?;
    sink.write_all(key_bytes).await?;

    let meta_bytes = meta_bytes.unwrap_or(&[]);
    if meta_bytes.len() > MAX_U16_LEN {
        return Err(CodecError::TooLarge {
            key: key.to_owned(),
            field: "meta",
            size: meta_bytes.len(),
            limit: MAX_U16_LEN,
        });
    }
    sink.write_u16_le(meta_bytes.len() as u16).await?;
    sink.write_all(meta_bytes).await?;

    if let Some(value) = value {
        if value.len() > MAX_U32_LEN {
            return Err(CodecError::TooLarge {
                key: key.to_owned(),
                field: "value",
                size: value.len(),
                limit: MAX_U32_LEN,
            });
        }
        sink.write_u32_le(value.len() as u32).await?;
        sink.write_all(value).await?;
    }

    Ok(())
}

/// Reads and parses an entire catalog in one pass.
///
/// Since the Loader always consumes every record to build the live map regardless, this parses
/// eagerly into a `Vec` rather than returning a lazy stream of records — same observable
/// behavior, much less ceremony.
///
/// A truncated or otherwise malformed record ends the parse at the last successfully-read record
/// boundary; this is never surfaced as an error, and is indistinguishable from reaching a clean
/// end-of-stream.
pub async fn decode_catalog<R>(reader: &mut R, expected_version: u8) -> DecodeResult
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    if reader.read_exact(&mut header).await.is_err() {
        // Empty or truncated-before-header file: treated the same as "no catalog".
        return DecodeResult::default();
    }

    let (version, mode_byte) = (header[0], header[1]);
    if version != expected_version {
        return DecodeResult {
            version_mismatch: true,
            ..DecodeResult::default()
        };
    }

    let mode = Mode::from_byte(mode_byte);
    let mut records = Vec::new();

    loop {
        match read_record(reader, mode).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) | Err(_) => break,
        }
    }

    DecodeResult {
        mode,
        records,
        version_mismatch: false,
    }
}

async fn read_record<R>(reader: &mut R, mode: Option<Mode>) -> io::Result<Option<DecodedRecord>>
where
    R: AsyncRead + Unpin,
{
    let key_len = match reader.read_u16_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut key_buf = vec![0u8; key_len as usize];
    reader.read_exact(&mut key_buf).await?;
    let key = String::from_utf8(key_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let meta_len = reader.read_u16_le().await?;
    let mut meta_bytes = vec![0u8; meta_len as usize];
    reader.read_exact(&mut meta_bytes).await?;

    let inline_value = if mode == Some(Mode::SingleFile) {
        let value_len = reader.read_u32_le().await?;
        let mut value_buf = vec![0u8; value_len as usize];
        reader.read_exact(&mut value_buf).await?;
        Some(value_buf)
    } else {
        None
    };

    Ok(Some(DecodedRecord {
        key,
        meta_bytes,
        inline_value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, prop_assert_eq};

    #[tokio::test]
    async fn round_trips_single_file_records() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(PROTOCOL_VERSION, Mode::SingleFile));
        write_record(&mut buf, "x", None, Some(b"hi")).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result = decode_catalog(&mut cursor, PROTOCOL_VERSION).await;

        assert!(!result.version_mismatch);
        assert_eq!(result.mode, Some(Mode::SingleFile));
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].key, "x");
        assert_eq!(result.records[0].meta_bytes.len(), 0);
        assert_eq!(result.records[0].inline_value.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn matches_s2_byte_layout() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(PROTOCOL_VERSION, Mode::SingleFile));
        write_record(&mut buf, "x", None, Some(b"hi")).await.unwrap();

        assert_eq!(
            buf,
            vec![0x01, 0x01, 0x01, 0x00, b'x', 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, b'h', b'i']
        );
    }

    #[tokio::test]
    async fn multi_file_mode_emits_no_value_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(PROTOCOL_VERSION, Mode::MultiFile));
        write_record(&mut buf, "k", None, None).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result = decode_catalog(&mut cursor, PROTOCOL_VERSION).await;
        assert_eq!(result.mode, Some(Mode::MultiFile));
        assert_eq!(result.records[0].inline_value, None);
    }

    #[tokio::test]
    async fn version_mismatch_is_treated_as_empty() {
        let buf = vec![0x00, 0x01, 0xFF, 0xFF];
        let mut cursor = std::io::Cursor::new(buf);
        let result = decode_catalog(&mut cursor, PROTOCOL_VERSION).await;
        assert!(result.version_mismatch);
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn truncated_record_stops_cleanly_without_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(PROTOCOL_VERSION, Mode::SingleFile));
        write_record(&mut buf, "a", None, Some(b"1")).await.unwrap();
        // Second record is cut off mid-key.
        buf.extend_from_slice(&[0x05, 0x00, b'b']);

        let mut cursor = std::io::Cursor::new(buf);
        let result = decode_catalog(&mut cursor, PROTOCOL_VERSION).await;
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].key, "a");
    }

    #[tokio::test]
    async fn empty_file_has_no_records_and_no_mismatch() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let result = decode_catalog(&mut cursor, PROTOCOL_VERSION).await;
        assert!(!result.version_mismatch);
        assert!(result.records.is_empty());
        assert_eq!(result.mode, None);
    }

    proptest::proptest! {
        #[test]
        fn round_trips_arbitrary_records(
            keys in proptest::collection::vec("[a-zA-Z0-9_]{1,40}", 0..20),
            meta_lens in proptest::collection::vec(0usize..200, 0..20),
            value_lens in proptest::collection::vec(0usize..4096, 0..20),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async move {
                let n = keys.len().min(meta_lens.len()).min(value_lens.len());
                let mut buf = Vec::new();
                buf.extend_from_slice(&encode_header(PROTOCOL_VERSION, Mode::SingleFile));

                let mut expected = Vec::new();
                for i in 0..n {
                    let meta = vec![b'm'; meta_lens[i]];
                    let value = vec![b'v'; value_lens[i]];
                    let meta_arg = if meta.is_empty() { None } else { Some(meta.as_slice()) };
                    write_record(&mut buf, &keys[i], meta_arg, Some(&value)).await.unwrap();
                    expected.push((keys[i].clone(), meta, value));
                }

                let mut cursor = std::io::Cursor::new(buf);
                let result = decode_catalog(&mut cursor, PROTOCOL_VERSION).await;
                prop_assert!(!result.version_mismatch);
                prop_assert_eq!(result.records.len(), n);
                for (record, (key, meta, value)) in result.records.iter().zip(expected.iter()) {
                    prop_assert_eq!(&record.key, key);
                    prop_assert_eq!(&record.meta_bytes, meta);
                    prop_assert_eq!(record.inline_value.as_ref(), Some(value));
                }
                Ok(())
            })?;
        }
    }
}
