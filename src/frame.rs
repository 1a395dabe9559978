//! Fixed 40-byte binary layout of a [`Sample`].
//!
//! ```text
//! offset  size  field
//!      0     4  sensor_id   i32 LE
//!      4     8  timestamp   i64 LE (ms)
//!     12     4  x           f32 LE
//!     16     4  y           f32 LE
//!     20     4  z           f32 LE
//!     24     4  qw          f32 LE
//!     28     4  qx          f32 LE
//!     32     4  qy          f32 LE
//!     36     4  qz          f32 LE
//! ```
//!
//! The layout is positional and unversioned. Any change breaks every peer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const FRAME_LEN: usize = 4 + 8 + 7 * 4;

/// One telemetry observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor_id: i64,
    /// Milliseconds since the log's own epoch.
    pub timestamp: i64,
    /// x, y, z
    pub position: [f32; 3],
    /// qw, qx, qy, qz. Not normalized.
    pub orientation: [f32; 4],
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("cannot encode {field}={value}: does not fit in {width}")]
    Encoding {
        field: &'static str,
        value: i64,
        width: &'static str,
    },

    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    Decoding { expected: usize, actual: usize },
}

pub fn encode(sample: &Sample) -> Result<Bytes, CodecError> {
    let sensor_id = i32::try_from(sample.sensor_id).map_err(|_| CodecError::Encoding {
        field: "sensor_id",
        value: sample.sensor_id,
        width: "i32",
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_i32_le(sensor_id);
    buf.put_i64_le(sample.timestamp);
    for v in sample.position.iter().chain(sample.orientation.iter()) {
        buf.put_f32_le(*v);
    }
    Ok(buf.freeze())
}

pub fn decode(frame: &[u8]) -> Result<Sample, CodecError> {
    if frame.len() != FRAME_LEN {
        return Err(CodecError::Decoding {
            expected: FRAME_LEN,
            actual: frame.len(),
        });
    }

    let mut buf = frame;
    let sensor_id = buf.get_i32_le() as i64;
    let timestamp = buf.get_i64_le();
    let position = [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()];
    let orientation = [
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
    ];

    Ok(Sample {
        sensor_id,
        timestamp,
        position,
        orientation,
    })
}
