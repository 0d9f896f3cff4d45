//! Line codec for the vMix TCP activator subscription.
//!
//! Wire format (plain text, CRLF-terminated lines):
//! - Outbound, once per connection: `SUBSCRIBE ACTS` followed by one
//!   `ACTS <name>` query per activator so the device reports current values
//! - Inbound notifications: `ACTS OK <name> <digit>`, digit `1` meaning active
//!
//! Every other inbound line (banners, unrelated notifications, activators
//! outside the fixed set) decodes to `None` and is ignored by callers.

use std::fmt;

/// Line terminator used for every outbound command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// The complete subscribe command sent after each successful connect.
pub const SUBSCRIBE_COMMAND: &str = "SUBSCRIBE ACTS\r\nACTS Recording\r\nACTS Streaming\r\nACTS External\r\nACTS MultiCorder\r\n";

/// Prefix of an activator notification.
const NOTIFICATION_PREFIX: &str = "ACTS OK ";

/// A named boolean signal reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activator {
    Recording,
    Streaming,
    External,
    MultiCorder,
}

impl Activator {
    /// Every activator, in subscription order.
    pub const ALL: [Activator; 4] = [
        Activator::Recording,
        Activator::Streaming,
        Activator::External,
        Activator::MultiCorder,
    ];

    /// Name as it appears on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Activator::Recording => "Recording",
            Activator::Streaming => "Streaming",
            Activator::External => "External",
            Activator::MultiCorder => "MultiCorder",
        }
    }
}

impl fmt::Display for Activator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded activator notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivatorUpdate {
    pub activator: Activator,
    pub active: bool,
}

/// Build the subscribe command: `SUBSCRIBE ACTS` plus one query per activator.
pub fn encode_subscribe() -> Vec<u8> {
    let mut command = String::with_capacity(SUBSCRIBE_COMMAND.len());
    command.push_str("SUBSCRIBE ACTS");
    command.push_str(LINE_TERMINATOR);
    for activator in Activator::ALL {
        command.push_str("ACTS ");
        command.push_str(activator.as_str());
        command.push_str(LINE_TERMINATOR);
    }
    command.into_bytes()
}

/// Decode one inbound line.
///
/// The notification may appear anywhere in the line. Only the first digit
/// after the activator name is inspected: `1` is active, any other digit is
/// inactive. Returns `None` for anything that is not a notification about one
/// of the four known activators.
pub fn decode_line(line: &str) -> Option<ActivatorUpdate> {
    line.match_indices(NOTIFICATION_PREFIX)
        .find_map(|(idx, prefix)| decode_notification(&line[idx + prefix.len()..]))
}

fn decode_notification(rest: &str) -> Option<ActivatorUpdate> {
    Activator::ALL.into_iter().find_map(|activator| {
        let tail = rest.strip_prefix(activator.as_str())?.strip_prefix(' ')?;
        let flag = tail.chars().next().filter(char::is_ascii_digit)?;
        Some(ActivatorUpdate {
            activator,
            active: flag == '1',
        })
    })
}
