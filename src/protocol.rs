use crate::{
    error::{BikeError, Result},
    types::{Dialect, DeviceProfile},
};
use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload the transport accepts in one write
pub const MAX_WRITE_LEN: usize = 20;

/// Length of a complete inbound telemetry frame
pub const TELEMETRY_FRAME_LEN: usize = 26;

/// First byte of every frame in both directions
pub const FRAME_START: u8 = 0xF0;

/// Length of a split telemetry head
pub const HEAD_LEN: usize = 20;

/// Telemetry heads that may arrive split, with the length of their tail
const SPLIT_HEADS: [([u8; 2], usize); 3] = [
    ([0xF0, 0xBC], 6),
    ([0xF0, 0xDB], 7),
    ([0xF0, 0xDD], 7),
];

const DISPLAY_TEMPLATE: [u8; 26] = [
    0xF0, 0xCB, 0x03, 0x00, 0x00, 0xFF, 0x01, 0x00, 0x00, 0x02, 0x01, 0x00, 0x00, 0x00, 0x01,
    0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF,
];

const KEEPALIVE: [u8; 2] = [0xF0, 0xAC];
const STOP_TAPE: [u8; 3] = [0xF0, 0xC8, 0x00];

const CHANG_YOW_POWER_ON_ICON: [u8; 22] = [
    0xF0, 0xAD, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0x01, 0xFF, 0xFF, 0xFF,
];
const CHANG_YOW_POWER_ON_WORD: [u8; 26] = [
    0xF0, 0xCB, 0x02, 0x00, 0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0x01, 0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF,
];
const CHANG_YOW_ARM_TAPE: [u8; 22] = [
    0xF0, 0xAD, 0xFF, 0xFF, 0x00, 0x05, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00,
    0xFF, 0xFF, 0xFF, 0x01, 0xFF, 0xFF, 0xFF,
];
const START_TAPE: [u8; 26] = [
    0xF0, 0xCB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01,
    0x00, 0x14, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Handshake frames of the ChangYow module, without checksum
const CHANG_YOW_HANDSHAKE: [&[u8]; 10] = [
    &[0xF0, 0xC8, 0x01],
    &[0xF0, 0xC9],
    &[0xF0, 0xA3],
    &[0xF0, 0xA4],
    &[0xF0, 0xA5],
    &[0xF0, 0xAB],
    &[0xF0, 0xC4, 0x03],
    &CHANG_YOW_POWER_ON_ICON,
    &CHANG_YOW_POWER_ON_WORD,
    &CHANG_YOW_ARM_TAPE,
];

/// Handshake frames of the Telink module, without checksum
///
/// The sequence is completed by a zeroed display update.
const TELINK_HANDSHAKE: [&[u8]; 4] = [
    &[0xF0, 0xC8, 0x01],
    &[0xF0, 0xC9],
    &KEEPALIVE,
    &[0xF0, 0xCC, 0xFF, 0xFF, 0xFF, 0xFF, 0x01, 0xFF],
];

/// Additive checksum: the mod-256 sum of every byte
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

fn seal(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.extend_from_slice(body);
    buf.put_u8(checksum(body));
    buf.freeze()
}

/// Values shown on the console by a display refresh
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DisplaySnapshot {
    /// Session time in seconds
    pub elapsed_secs: u32,
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Heart rate in bpm
    pub heart_rate_bpm: u8,
    /// Cadence in rpm
    pub cadence_rpm: f64,
    /// Energy in kcal
    pub calories_kcal: f64,
}

/// Acknowledgment a write waits for before the flow continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The transport confirmed the write
    Written,
    /// The bike answered with a notification (see [`is_response_ack`])
    Response,
}

/// One transport write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// Bytes to write, at most [`MAX_WRITE_LEN`]
    pub data: Bytes,
    /// Acknowledgment to wait for after writing
    pub ack: Ack,
}

/// Outgoing command, rendered to bytes right before transmission
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutboundCommand {
    /// Frame `step` of the dialect handshake
    Handshake {
        /// Position in the dialect's handshake table
        step: usize,
    },
    /// Console refresh
    DisplayUpdate(DisplaySnapshot),
    /// Odometer shown on the console
    DistanceDisplay {
        /// Distance in km
        odometer_km: f64,
    },
    /// Resistance level, already clamped to the bike's range
    ResistanceWrite(u8),
    /// No-op that keeps the console awake
    Keepalive,
    /// Start-tape suffix of a starting handshake
    StartTape,
    /// Stop the session on the console
    StopTape,
}

impl OutboundCommand {
    /// Render the complete frame, checksum included
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::Protocol`] for a handshake step the dialect does
    /// not have.
    pub fn encode(&self, profile: &DeviceProfile) -> Result<Bytes> {
        let frame = match self {
            Self::Handshake { step } => {
                let table: &[&[u8]] = match profile.dialect {
                    Dialect::ChangYow => &CHANG_YOW_HANDSHAKE,
                    Dialect::Telink => &TELINK_HANDSHAKE,
                };
                let body = table.get(*step).ok_or_else(|| {
                    BikeError::Protocol(format!(
                        "{} handshake has no step {step}",
                        profile.dialect
                    ))
                })?;
                seal(body)
            }
            Self::DisplayUpdate(snapshot) => encode_display(snapshot, profile),
            Self::DistanceDisplay { odometer_km } => encode_distance(*odometer_km),
            Self::ResistanceWrite(level) => encode_resistance(*level),
            Self::Keepalive => seal(&KEEPALIVE),
            Self::StartTape => seal(&START_TAPE),
            Self::StopTape => seal(&STOP_TAPE),
        };
        Ok(frame)
    }

    /// Acknowledgment the last write of this command waits for
    #[must_use]
    pub const fn final_ack(&self, profile: &DeviceProfile) -> Ack {
        match self {
            Self::Handshake { .. } => match profile.dialect {
                Dialect::ChangYow => Ack::Response,
                Dialect::Telink => Ack::Written,
            },
            Self::DisplayUpdate(_)
            | Self::DistanceDisplay { .. }
            | Self::Keepalive
            | Self::StartTape => Ack::Response,
            Self::ResistanceWrite(_) | Self::StopTape => Ack::Written,
        }
    }

    /// Render the command as the sequence of transport writes
    ///
    /// # Errors
    ///
    /// See [`OutboundCommand::encode`].
    pub fn to_chunks(&self, profile: &DeviceProfile) -> Result<Vec<WriteChunk>> {
        let frame = self.encode(profile)?;
        Ok(split(frame, self.final_ack(profile)))
    }

    /// Short name used in logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::DisplayUpdate(_) => "display",
            Self::DistanceDisplay { .. } => "distance display",
            Self::ResistanceWrite(_) => "resistance",
            Self::Keepalive => "keepalive",
            Self::StartTape => "start tape",
            Self::StopTape => "stop tape",
        }
    }
}

/// Split a frame into writes of at most [`MAX_WRITE_LEN`] bytes
///
/// Every write but the last waits for [`Ack::Written`]; the last one waits
/// for `final_ack`.
#[must_use]
pub fn split(frame: Bytes, final_ack: Ack) -> Vec<WriteChunk> {
    let mut chunks = Vec::with_capacity(frame.len().div_ceil(MAX_WRITE_LEN).max(1));
    let mut start = 0;
    while start < frame.len() {
        let end = (start + MAX_WRITE_LEN).min(frame.len());
        let ack = if end == frame.len() {
            final_ack
        } else {
            Ack::Written
        };
        chunks.push(WriteChunk {
            data: frame.slice(start..end),
            ack,
        });
        start = end;
    }
    chunks
}

/// Ordered handshake for a dialect
///
/// `start_tape` appends the start suffix on dialects that have one.
#[must_use]
pub fn handshake_sequence(profile: &DeviceProfile, start_tape: bool) -> Vec<OutboundCommand> {
    match profile.dialect {
        Dialect::ChangYow => {
            let mut sequence: Vec<_> = (0..CHANG_YOW_HANDSHAKE.len())
                .map(|step| OutboundCommand::Handshake { step })
                .collect();
            if start_tape {
                sequence.push(OutboundCommand::StartTape);
            }
            sequence
        }
        Dialect::Telink => {
            let mut sequence: Vec<_> = (0..TELINK_HANDSHAKE.len())
                .map(|step| OutboundCommand::Handshake { step })
                .collect();
            sequence.push(OutboundCommand::DisplayUpdate(DisplaySnapshot::default()));
            sequence
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_display(snapshot: &DisplaySnapshot, profile: &DeviceProfile) -> Bytes {
    let scale = profile.display_scale;
    let mut frame = DISPLAY_TEMPLATE;

    let elapsed = snapshot.elapsed_secs;
    frame[3] = (elapsed / 60) as u8;
    frame[4] = (elapsed % 60) as u8;

    let speed = (snapshot.speed_kmh * f64::from(scale)) as u16;
    frame[7..9].copy_from_slice(&speed.to_be_bytes());

    frame[12] = snapshot.heart_rate_bpm;

    if profile.wide_cadence {
        let cadence = (snapshot.cadence_rpm as u16).wrapping_mul(scale);
        frame[15..17].copy_from_slice(&cadence.to_be_bytes());
    } else {
        frame[16] = (snapshot.cadence_rpm * f64::from(scale)) as u8;
    }

    let calories = (snapshot.calories_kcal as u16).wrapping_mul(scale);
    frame[19..21].copy_from_slice(&calories.to_be_bytes());

    seal(&frame)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_distance(odometer_km: f64) -> Bytes {
    let mut frame = [0xFF; 26];
    frame[..3].copy_from_slice(&[0xF0, 0xCD, 0x01]);
    let tenths = (odometer_km * 10.0) as u16;
    frame[3..5].copy_from_slice(&tenths.to_be_bytes());
    frame[5] = 0x01;
    seal(&frame)
}

fn encode_resistance(level: u8) -> Bytes {
    let mut frame = [0xFF; 22];
    frame[..2].copy_from_slice(&[0xF0, 0xAD]);
    frame[10] = level;
    frame[17] = 0x00;
    frame[18] = 0x01;
    seal(&frame)
}

/// A complete 26-byte telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFrame([u8; TELEMETRY_FRAME_LEN]);

impl TelemetryFrame {
    /// Wrap a raw notification
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::ParseError`] unless `data` is exactly
    /// [`TELEMETRY_FRAME_LEN`] bytes long.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; TELEMETRY_FRAME_LEN] = data.try_into().map_err(|_| {
            BikeError::ParseError(format!(
                "Telemetry frame is {} bytes, expected {TELEMETRY_FRAME_LEN}",
                data.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw frame bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TELEMETRY_FRAME_LEN] {
        &self.0
    }
}

/// Outcome of feeding one notification to the [`FrameAssembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// A split head was buffered, its tail is expected next
    Incomplete,
    /// Not telemetry (acknowledgments, short replies, orphan tails)
    Ignored,
    /// A full telemetry frame
    Complete(TelemetryFrame),
}

/// Expected tail length when `head` is a recognized split head
fn tail_len(head: &[u8]) -> Option<usize> {
    if head.len() != HEAD_LEN {
        return None;
    }
    SPLIT_HEADS
        .iter()
        .find(|(prefix, _)| head.starts_with(prefix))
        .map(|(_, len)| *len)
}

/// Single-slot reassembly of split telemetry notifications
///
/// The most recent notification always replaces the slot, so a head that is
/// not followed by its tail is dropped when anything else arrives.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    last: BytesMut,
    fragmenting: bool,
}

impl FrameAssembler {
    /// Create an assembler for a dialect
    #[must_use]
    pub fn new(profile: &DeviceProfile) -> Self {
        Self {
            last: BytesMut::with_capacity(TELEMETRY_FRAME_LEN),
            fragmenting: profile.fragmenting,
        }
    }

    /// Feed one raw notification
    pub fn accept(&mut self, chunk: &[u8]) -> Assembly {
        if self.fragmenting && tail_len(&self.last) == Some(chunk.len()) {
            self.last.extend_from_slice(chunk);
            // 7-byte tails carry one byte past the telemetry fields
            return TelemetryFrame::from_slice(&self.last[..TELEMETRY_FRAME_LEN])
                .map_or(Assembly::Ignored, Assembly::Complete);
        }

        self.last.clear();
        self.last.extend_from_slice(chunk);
        if chunk.len() == TELEMETRY_FRAME_LEN {
            return TelemetryFrame::from_slice(chunk).map_or(Assembly::Ignored, Assembly::Complete);
        }
        if self.has_pending_partial() {
            Assembly::Incomplete
        } else {
            Assembly::Ignored
        }
    }

    /// A split head is waiting for its tail
    #[must_use]
    pub fn has_pending_partial(&self) -> bool {
        self.fragmenting && tail_len(&self.last).is_some()
    }

    /// Drop whatever is buffered
    pub fn reset(&mut self) {
        self.last.clear();
    }
}

/// Whether a notification of `len` bytes acknowledges a [`Ack::Response`] write
///
/// Command replies are short and telemetry is 26 bytes; only a bare 20-byte
/// head is not an answer.
#[must_use]
pub const fn is_response_ack(len: usize) -> bool {
    len != HEAD_LEN
}
