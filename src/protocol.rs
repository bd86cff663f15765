//! Wire format for LipoDoc status and donation messages.
//!
//! Every message is a sequence of ASCII fields joined by the reserved
//! [`SEPARATOR`] byte and closed by [`TERMINATOR`] followed by a line feed.
//! Both reserved bytes lie outside 7-bit ASCII, so any ASCII field without a
//! line feed can be framed without escaping.
//!
//! Encoding is pure: no clocks, no randomness, no I/O. Random field values
//! come from [`crate::generator::DataGenerator`].

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field separator (`ª`, 0xAA).
pub const SEPARATOR: u8 = 0xAA;

/// End-of-record marker (`ý`, 0xFD), always followed by [`LINE_FEED`].
pub const TERMINATOR: u8 = 0xFD;

/// Line feed closing every record.
pub const LINE_FEED: u8 = b'\n';

/// Prefix of a positive server acknowledgment.
pub const ACK_MARKER: &str = "#A";

/// `HH:MM:SS` immediately followed by `DD:MM:YYYY`.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S%d:%m:%Y";

/// Number of fields in a status message.
pub const STATUS_FIELD_COUNT: usize = 6;

/// Number of fields in a donation message, identical for every variant.
pub const DONATION_FIELD_COUNT: usize = 14;

const STATUS_TAG: &str = "#S";
const DONATION_TAG: &str = "#D";
const BARCODE_TAG: &str = "B";
const MEASUREMENT_TAG: &str = "M";
const END_TAG: &str = "ENDE";

/// Errors raised while building a message.
///
/// These indicate a defect in the caller's inputs, never a network problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A field value contains bytes outside 7-bit ASCII
    #[error("field `{field}` contains non-ASCII data")]
    NonAscii { field: &'static str },

    /// A field value contains a line feed
    #[error("field `{field}` contains a line feed")]
    LineFeed { field: &'static str },

    /// A format variant number outside 1-5
    #[error("unknown format variant {0} (expected 1-5)")]
    UnknownVariant(u8),
}

/// Check that `value` can be placed in a field without breaking framing.
pub fn validate_field(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if !value.is_ascii() {
        return Err(ProtocolError::NonAscii { field });
    }
    if value.as_bytes().contains(&LINE_FEED) {
        return Err(ProtocolError::LineFeed { field });
    }
    Ok(())
}

/// Simulated operational state reported in status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Idle,
    ProcessInProgress,
    ProcessCompleted,
}

impl DeviceStatus {
    /// Get all status codes in wire order.
    pub fn all() -> &'static [DeviceStatus] {
        &[
            DeviceStatus::Idle,
            DeviceStatus::ProcessInProgress,
            DeviceStatus::ProcessCompleted,
        ]
    }

    /// Numeric code sent on the wire.
    pub fn code(self) -> u8 {
        match self {
            DeviceStatus::Idle => 0,
            DeviceStatus::ProcessInProgress => 1,
            DeviceStatus::ProcessCompleted => 2,
        }
    }

    /// Inverse of [`DeviceStatus::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        Self::all().get(usize::from(code)).copied()
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Idle => write!(f, "idle"),
            DeviceStatus::ProcessInProgress => write!(f, "process in progress"),
            DeviceStatus::ProcessCompleted => write!(f, "process completed"),
        }
    }
}

/// Which barcode fields a donation message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FormatVariant {
    /// REF, donation ID, operator ID and LOT
    AllBarcodes,
    /// No barcode fields populated
    NoBarcodes,
    /// REF and donation ID only
    RequiredOnly,
    /// REF, donation ID and operator ID
    RequiredWithOperator,
    /// REF, donation ID and LOT
    RequiredWithLot,
}

/// Presence flags for the four barcode fields, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarcodeLayout {
    pub reference: bool,
    pub donation_id: bool,
    pub operator_id: bool,
    pub lot_number: bool,
}

impl FormatVariant {
    /// Get all variants in numeric order.
    pub fn all() -> &'static [FormatVariant] {
        &[
            FormatVariant::AllBarcodes,
            FormatVariant::NoBarcodes,
            FormatVariant::RequiredOnly,
            FormatVariant::RequiredWithOperator,
            FormatVariant::RequiredWithLot,
        ]
    }

    /// Variant number (1-5).
    pub fn number(self) -> u8 {
        match self {
            FormatVariant::AllBarcodes => 1,
            FormatVariant::NoBarcodes => 2,
            FormatVariant::RequiredOnly => 3,
            FormatVariant::RequiredWithOperator => 4,
            FormatVariant::RequiredWithLot => 5,
        }
    }

    /// Human-readable name, as offered to operators.
    pub fn name(self) -> &'static str {
        match self {
            FormatVariant::AllBarcodes => "All barcodes (REF, DonationID, OperatorID, LOT)",
            FormatVariant::NoBarcodes => "No barcodes",
            FormatVariant::RequiredOnly => "Required barcodes only (REF, DonationID)",
            FormatVariant::RequiredWithOperator => "Required + OperatorID barcodes",
            FormatVariant::RequiredWithLot => "Required + LOT barcodes",
        }
    }

    pub fn layout(self) -> BarcodeLayout {
        let (reference, donation_id, operator_id, lot_number) = match self {
            FormatVariant::AllBarcodes => (true, true, true, true),
            FormatVariant::NoBarcodes => (false, false, false, false),
            FormatVariant::RequiredOnly => (true, true, false, false),
            FormatVariant::RequiredWithOperator => (true, true, true, false),
            FormatVariant::RequiredWithLot => (true, true, false, true),
        };
        BarcodeLayout {
            reference,
            donation_id,
            operator_id,
            lot_number,
        }
    }
}

impl TryFrom<u8> for FormatVariant {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1..=5 => Ok(Self::all()[usize::from(value - 1)]),
            other => Err(ProtocolError::UnknownVariant(other)),
        }
    }
}

impl From<FormatVariant> for u8 {
    fn from(variant: FormatVariant) -> Self {
        variant.number()
    }
}

impl std::fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "format {}", self.number())
    }
}

/// The four barcode values scanned for a donation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barcodes {
    pub reference: String,
    pub donation_id: String,
    pub operator_id: String,
    pub lot_number: String,
}

/// Lipemic group reported by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LipemicGroup {
    I,
    II,
    III,
    IV,
}

impl LipemicGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            LipemicGroup::I => "I",
            LipemicGroup::II => "II",
            LipemicGroup::III => "III",
            LipemicGroup::IV => "IV",
        }
    }
}

/// Pass/fail verdict of a lipemic measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LipemicStatus {
    Passed,
    Lipemic,
}

impl LipemicStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LipemicStatus::Passed => "PASSED",
            LipemicStatus::Lipemic => "LIPEMIC",
        }
    }
}

/// A lipemic measurement together with its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LipemicReading {
    pub value: u32,
    pub group: LipemicGroup,
    pub status: LipemicStatus,
}

impl LipemicReading {
    /// Classify a raw measurement.
    ///
    /// | value | group | status |
    /// |---|---|---|
    /// | < 250 | I | PASSED |
    /// | 250..400 | II | PASSED |
    /// | 400..550 | II | LIPEMIC |
    /// | 550..2500 | III | LIPEMIC |
    /// | >= 2500 | IV | LIPEMIC |
    pub fn classify(value: u32) -> Self {
        let (group, status) = match value {
            0..=249 => (LipemicGroup::I, LipemicStatus::Passed),
            250..=399 => (LipemicGroup::II, LipemicStatus::Passed),
            400..=549 => (LipemicGroup::II, LipemicStatus::Lipemic),
            550..=2499 => (LipemicGroup::III, LipemicStatus::Lipemic),
            _ => (LipemicGroup::IV, LipemicStatus::Lipemic),
        };
        Self {
            value,
            group,
            status,
        }
    }
}

/// Periodic heartbeat reporting device state and backlog size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub serial: String,
    pub status: DeviceStatus,
    pub timestamp: NaiveDateTime,
    pub pending: usize,
    pub checksum: String,
}

impl StatusMessage {
    /// Render the message into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        validate_field("serial", &self.serial)?;
        validate_field("checksum", &self.checksum)?;

        let status = self.status.code().to_string();
        let timestamp = format_timestamp(&self.timestamp);
        let pending = self.pending.to_string();

        Ok(frame(&[
            STATUS_TAG,
            &self.serial,
            &status,
            &timestamp,
            &pending,
            &self.checksum,
        ]))
    }
}

/// One lipemic test result, laid out according to its [`FormatVariant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationMessage {
    pub serial: String,
    pub timestamp: NaiveDateTime,
    pub variant: FormatVariant,
    pub barcodes: Barcodes,
    pub lipemic: LipemicReading,
    pub checksum: String,
}

impl DonationMessage {
    /// Render the message into wire bytes.
    ///
    /// Barcodes the variant leaves out are written as empty fields so that
    /// every variant has [`DONATION_FIELD_COUNT`] fields.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        validate_field("serial", &self.serial)?;
        validate_field("reference", &self.barcodes.reference)?;
        validate_field("donation_id", &self.barcodes.donation_id)?;
        validate_field("operator_id", &self.barcodes.operator_id)?;
        validate_field("lot_number", &self.barcodes.lot_number)?;
        validate_field("checksum", &self.checksum)?;

        let layout = self.variant.layout();
        let pick = |present: bool, value: &str| {
            if present {
                value.to_string()
            } else {
                String::new()
            }
        };
        let reference = pick(layout.reference, &self.barcodes.reference);
        let donation_id = pick(layout.donation_id, &self.barcodes.donation_id);
        let operator_id = pick(layout.operator_id, &self.barcodes.operator_id);
        let lot_number = pick(layout.lot_number, &self.barcodes.lot_number);

        let timestamp = format_timestamp(&self.timestamp);
        let value = self.lipemic.value.to_string();

        Ok(frame(&[
            DONATION_TAG,
            &self.serial,
            &timestamp,
            BARCODE_TAG,
            &reference,
            &donation_id,
            &operator_id,
            &lot_number,
            MEASUREMENT_TAG,
            &value,
            self.lipemic.group.as_str(),
            self.lipemic.status.as_str(),
            END_TAG,
            &self.checksum,
        ]))
    }
}

/// Format a timestamp as the protocol expects (`HH:MM:SSDD:MM:YYYY`).
pub fn format_timestamp(timestamp: &NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Join fields with the separator and append the record terminator.
fn frame(fields: &[&str]) -> Vec<u8> {
    let len = fields.iter().map(|f| f.len() + 1).sum::<usize>() + 1;
    let mut out = Vec::with_capacity(len);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.extend_from_slice(field.as_bytes());
    }
    out.push(TERMINATOR);
    out.push(LINE_FEED);
    out
}

/// Split a complete record into its fields.
///
/// Returns `None` if the record is not closed by terminator + line feed.
pub fn split_fields(record: &[u8]) -> Option<Vec<&[u8]>> {
    let body = record.strip_suffix(&[TERMINATOR, LINE_FEED])?;
    Some(body.split(|b| *b == SEPARATOR).collect())
}

/// Render wire bytes for logs, showing the reserved bytes as `ª` and `ý`.
pub fn printable(record: &[u8]) -> String {
    record
        .iter()
        .filter(|b| **b != LINE_FEED)
        .map(|b| match *b {
            SEPARATOR => 'ª',
            TERMINATOR => 'ý',
            other => char::from(other),
        })
        .collect()
}
