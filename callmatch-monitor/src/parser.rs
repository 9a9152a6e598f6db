//! Parsing of call monitor records.
//!
//! Each record is a line of `;` separated fields:
//! `<timestamp>;<event type>;<connection id>;<caller>;<called>;<line id>;`
//!
//! For example: `01.01.25 10:30:00;RING;0;0151234567890;200893;SIP0;`
use crate::error::ParseError;

/// The event type of an incoming call that is currently ringing.
pub const RING: &str = "RING";

const MIN_FIELDS: usize = 6;

/// An incoming call as announced by the call monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEvent {
    /// Timestamp as formatted by the call monitor. Kept for logging only.
    pub source_timestamp: String,
    pub connection_id: String,
    /// The true calling party.
    pub caller_number: String,
    /// The number that was dialed.
    pub called_number: String,
    pub line_id: String,
}

impl RingEvent {
    /// Whether this call was made to `destination_number`, by substring containment:
    /// `200893` also matches a called number of `0301200893`.
    pub fn is_for(&self, destination_number: &str) -> bool {
        self.called_number.contains(destination_number)
    }
}

/// Parse one call monitor record.
///
/// Returns `Ok(None)` for well-formed records of any event type other than `RING`.
pub fn parse_line(line: &str) -> Result<Option<RingEvent>, ParseError> {
    let fields: Vec<&str> = line.trim().split(';').collect();

    if fields.len() < MIN_FIELDS {
        return Err(ParseError::TooFewFields {
            found: fields.len(),
        });
    }

    if fields[1] != RING {
        return Ok(None);
    }

    Ok(Some(RingEvent {
        source_timestamp: fields[0].to_owned(),
        connection_id: fields[2].to_owned(),
        caller_number: fields[3].to_owned(),
        called_number: fields[4].to_owned(),
        line_id: fields[5].to_owned(),
    }))
}
