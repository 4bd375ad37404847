//! Wire protocol for map-node to reducer page delivery.
//!
//! Defines the page envelope message and frame-based serialization.
//! Messages are length-prefixed using bincode encoding.

use common::{Row, SourceId};
use serde::{Deserialize, Serialize};

/// One result page as it travels from a map node to the reducer.
///
/// `all_rows` is present only on the first page a source sends and carries
/// the total number of rows that source will ever produce. The two flags
/// mark sentinel pages: a failed source or the end of a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageEnvelope {
    /// Node the page came from.
    pub source: SourceId,
    /// Row batch; empty for sentinels and for empty first pages.
    pub rows: Vec<Row>,
    /// Total rows the source will send, first page only.
    pub all_rows: Option<u64>,
    /// The source failed; `error` carries the reason.
    pub is_fail: bool,
    /// No more pages will follow from any source.
    pub is_last: bool,
    /// Failure reason, present when `is_fail` is set.
    pub error: Option<String>,
}

impl PageEnvelope {
    /// A data page with an optional first-page total.
    pub fn data(source: SourceId, rows: Vec<Row>, all_rows: Option<u64>) -> Self {
        Self {
            source,
            rows,
            all_rows,
            is_fail: false,
            is_last: false,
            error: None,
        }
    }

    /// A failure sentinel for the given source.
    pub fn fail(source: SourceId, error: impl Into<String>) -> Self {
        Self {
            source,
            rows: Vec::new(),
            all_rows: None,
            is_fail: true,
            is_last: false,
            error: Some(error.into()),
        }
    }

    /// Number of payload rows carried by this envelope.
    pub fn rows_in_page(&self) -> usize {
        self.rows.len()
    }
}

/// Frame format: [u32 length (little-endian)][bincode payload]
pub mod frame {
    use super::*;
    use bincode::config;
    use std::io::{self, Read, Write};

    const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024; // 64 MB

    /// Write a framed message.
    ///
    /// Format: [u32 length][bincode payload]
    pub fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
    where
        W: Write,
        T: Serialize,
    {
        let encoded = bincode::serde::encode_to_vec(message, config::standard())
            .map_err(|e| io::Error::other(format!("bincode encoding failed: {}", e)))?;

        let len = encoded.len() as u32;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }

        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        Ok(())
    }

    /// Read a framed message.
    ///
    /// Format: [u32 length][bincode payload]
    pub fn read_message<R, T>(reader: &mut R) -> io::Result<T>
    where
        R: Read,
        T: for<'de> Deserialize<'de>,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);

        if len > MAX_FRAME_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let (message, _) = bincode::serde::decode_from_slice(&payload, config::standard())
            .map_err(|e| io::Error::other(format!("bincode decoding failed: {}", e)))?;

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use types::Value;

    #[test]
    fn round_trip_first_page() {
        let source = SourceId::random();
        let env = PageEnvelope::data(
            source,
            vec![Row::new(vec![Value::Int(1), Value::Text("alice".into())])],
            Some(5),
        );

        let mut buf = Vec::new();
        frame::write_message(&mut buf, &env).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: PageEnvelope = frame::read_message(&mut cursor).unwrap();

        assert_eq!(decoded.source, source);
        assert_eq!(decoded.all_rows, Some(5));
        assert_eq!(decoded.rows_in_page(), 1);
        assert!(!decoded.is_fail);
        assert!(!decoded.is_last);
    }

    #[test]
    fn round_trip_fail_sentinel() {
        let env = PageEnvelope::fail(SourceId::random(), "node left the grid");

        let mut buf = Vec::new();
        frame::write_message(&mut buf, &env).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: PageEnvelope = frame::read_message(&mut cursor).unwrap();

        assert!(decoded.is_fail);
        assert_eq!(decoded.error.as_deref(), Some("node left the grid"));
        assert_eq!(decoded.rows_in_page(), 0);
    }

    #[test]
    fn truncated_frame_errors() {
        let env = PageEnvelope::data(SourceId::random(), vec![], Some(0));

        let mut buf = Vec::new();
        frame::write_message(&mut buf, &env).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = Cursor::new(buf);
        let result: std::io::Result<PageEnvelope> = frame::read_message(&mut cursor);
        assert!(result.is_err());
    }
}
