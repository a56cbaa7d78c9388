//! # Record Framing
//!
//! Wire records are newline-terminated ASCII lines `TAG:x,y,z` where `TAG` is
//! `ACCEL` or `GYRO` and each value carries three fractional digits. Every
//! record is encoded into one buffer so the dispatcher can hand it to the sink
//! in a single write.
//!
//! A logical stream opens with a handshake token ([`StreamTag`]) naming the
//! feed it carries.

use std::fmt;

use bytes::Bytes;

use crate::error::MuxError;

/// Kind of a single sensor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Accel,
    Gyro,
}

impl SensorKind {
    /// Record prefix on the wire.
    pub fn prefix(&self) -> &'static str {
        match self {
            SensorKind::Accel => "ACCEL",
            SensorKind::Gyro => "GYRO",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "ACCEL" => Some(SensorKind::Accel),
            "GYRO" => Some(SensorKind::Gyro),
            _ => None,
        }
    }
}

/// Handshake token sent first on every logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    Accel,
    Gyro,
    /// One stream carrying interleaved, self-describing ACCEL and GYRO records.
    Both,
}

impl StreamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTag::Accel => "accel",
            StreamTag::Gyro => "gyro",
            StreamTag::Both => "both",
        }
    }

    /// Parses a handshake token, ignoring surrounding whitespace.
    pub fn parse(token: &str) -> Result<Self, MuxError> {
        match token.trim() {
            "accel" => Ok(StreamTag::Accel),
            "gyro" => Ok(StreamTag::Gyro),
            "both" => Ok(StreamTag::Both),
            other => Err(MuxError::MalformedRecord(format!(
                "unknown stream tag '{}'",
                other
            ))),
        }
    }

    /// Whether records of `kind` belong on a stream with this tag.
    pub fn accepts(&self, kind: SensorKind) -> bool {
        matches!(
            (self, kind),
            (StreamTag::Both, _)
                | (StreamTag::Accel, SensorKind::Accel)
                | (StreamTag::Gyro, SensorKind::Gyro)
        )
    }

    /// Handshake bytes as written by the TCP sink.
    pub fn handshake(&self) -> Bytes {
        Bytes::from(format!("{}\n", self.as_str()))
    }
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One three-axis reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub kind: SensorKind,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    pub fn new(kind: SensorKind, x: f64, y: f64, z: f64) -> Self {
        Self { kind, x, y, z }
    }

    /// Encodes a complete, newline-terminated record.
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!(
            "{}:{:.3},{:.3},{:.3}\n",
            self.kind.prefix(),
            self.x,
            self.y,
            self.z
        ))
    }

    /// Decodes one record line. The trailing newline is optional.
    pub fn parse(line: &str) -> Result<Self, MuxError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let malformed = || MuxError::MalformedRecord(line.to_string());

        let (prefix, values) = line.split_once(':').ok_or_else(malformed)?;
        let kind = SensorKind::from_prefix(prefix).ok_or_else(malformed)?;

        let mut fields = values.split(',');
        let mut next = || -> Result<f64, MuxError> {
            let field = fields.next().ok_or_else(malformed)?;
            let value: f64 = field.trim().parse().map_err(|_| malformed())?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(malformed())
            }
        };
        let (x, y, z) = (next()?, next()?, next()?);
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(Self { kind, x, y, z })
    }
}
