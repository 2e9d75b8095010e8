use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One unit of sensor input moving through the pipeline.
///
/// A frame has exactly one owner at a time. Handing it to the buffer, a
/// worker or the transform moves it; whichever stage ends up holding it
/// without passing it on releases the payload when the frame is dropped.
#[derive(Debug)]
pub struct Frame<P = Image> {
    payload: P,

    /// Monotonic capture time, relative to the stream's clock origin
    timestamp: Duration,

    /// Assigned by the buffer when the frame is accepted
    sequence: u64,
}

impl<P> Frame<P> {
    pub fn new(payload: P, timestamp: Duration) -> Self {
        Self {
            payload,
            timestamp,
            sequence: 0,
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }
}

/// Raw image handed over by the capture side
#[derive(Debug, Clone)]
pub struct Image {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Image {
    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }
}
