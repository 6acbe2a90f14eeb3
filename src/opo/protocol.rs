//! OPO controller wire protocol.
//!
//! Protocol Overview:
//! - Transport: TCP, default port 1315
//! - Format: ASCII, one command per line
//! - Terminator: CR+LF (\r\n) in both directions
//! - Commands: `GOTO <nm>`, `SETSPD <nm/s>`, `TELLWL`, `TELLSTAT`, `CLOSE`
//!
//! Response Formats:
//! - `TELLSTAT` -> `0x0` (idle) or `0x<nonzero>` (moving)
//! - `TELLWL` -> wavelength float, e.g. `750.12345`
//! - `GOTO` / `SETSPD` -> error code 0-7
//!
//! Several responses may arrive in one TCP read, and a response may be split
//! across reads; [`LineBuffer`] reassembles complete lines before
//! [`classify_line`] decodes them. Nothing here performs I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Line terminator for commands and responses.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Default controller TCP port.
pub const DEFAULT_PORT: u16 = 1315;

/// Numeric responses below this are error codes, at or above it wavelengths.
///
/// Error codes are 0-7 and real near-IR wavelengths are >= 710 nm. Changing this
/// requires re-validating against the controller's actual error-code range.
pub const ERROR_CODE_BOUNDARY: f64 = 10.0;

/// Motor speeds the controller accepts (nm/s).
pub const SPEED_RANGE_NM_PER_SEC: std::ops::RangeInclusive<f64> = 0.5..=5.0;

const HEX_PREFIX: &str = "0x";

// =============================================================================
// Commands
// =============================================================================

/// Outbound controller command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpoCommand {
    /// Move the motor to a near-IR wavelength (nm)
    Goto(f64),
    /// Set motor speed (nm/s)
    SetSpeed(f64),
    /// Query current wavelength
    TellWavelength,
    /// Query motor status
    TellStatus,
    /// Ask the controller to close its listener
    Close,
}

impl OpoCommand {
    /// Full wire line including terminator.
    pub fn to_line(&self) -> String {
        format!("{}{}", self, LINE_TERMINATOR)
    }
}

impl fmt::Display for OpoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpoCommand::Goto(nm) => write!(f, "GOTO {:.3}", nm),
            OpoCommand::SetSpeed(speed) => write!(f, "SETSPD {:.3}", speed),
            OpoCommand::TellWavelength => write!(f, "TELLWL"),
            OpoCommand::TellStatus => write!(f, "TELLSTAT"),
            OpoCommand::Close => write!(f, "CLOSE"),
        }
    }
}

// =============================================================================
// Error codes
// =============================================================================

/// Controller reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 0
    Success,
    /// 1
    InvalidCommand,
    /// 2
    WindowNotOpen,
    /// 3
    ValueOutOfRange,
    /// 4
    VelocityOutOfRange,
    /// 5
    GotoAlreadyActive,
    /// 6
    SettingsLockedWhileMoving,
    /// 7
    NoVoltmeter,
}

impl ErrorCode {
    /// Decode a numeric reply.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::InvalidCommand,
            2 => ErrorCode::WindowNotOpen,
            3 => ErrorCode::ValueOutOfRange,
            4 => ErrorCode::VelocityOutOfRange,
            5 => ErrorCode::GotoAlreadyActive,
            6 => ErrorCode::SettingsLockedWhileMoving,
            7 => ErrorCode::NoVoltmeter,
            _ => return None,
        })
    }

    /// Numeric code as sent on the wire.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this code reports a fault (anything but success).
    pub fn is_fault(self) -> bool {
        self != ErrorCode::Success
    }

    /// Controller's description of the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Success => "Successfully Executed Command",
            ErrorCode::InvalidCommand => "Invalid Command",
            ErrorCode::WindowNotOpen => "Required Window Not Open",
            ErrorCode::ValueOutOfRange => "Specified Value Is Out Of Range",
            ErrorCode::VelocityOutOfRange => "Specified Velocity Is Out Of Safe Values",
            ErrorCode::GotoAlreadyActive => "A GoTo Operation Is Already Active",
            ErrorCode::SettingsLockedWhileMoving => {
                "Unable To Change Settings While Motor Movement Active"
            }
            ErrorCode::NoVoltmeter => "No USB Voltmeter Detected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

// =============================================================================
// State enums
// =============================================================================

/// Link connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Socket open
    Connected,
}

/// Motor movement status as last reported or commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorStatus {
    /// Motor stopped
    Idle,
    /// Motor moving (or a move was just issued)
    Moving,
}

// =============================================================================
// Inbound classification
// =============================================================================

/// One decoded response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Hex status word; `Idle` only for the all-zero word
    Status(MotorStatus),
    /// Numeric reply below [`ERROR_CODE_BOUNDARY`]
    Code(ErrorCode),
    /// Numeric reply at or above [`ERROR_CODE_BOUNDARY`] (nm)
    Wavelength(f64),
    /// Anything else; logged only
    Message(String),
}

/// Classify one response line (terminator already removed).
///
/// Order matters: hex status first, then non-numeric text, then numeric
/// values split by magnitude into error codes and wavelengths.
pub fn classify_line(line: &str) -> Inbound {
    let line = line.trim();

    if let Some(hex) = line
        .strip_prefix(HEX_PREFIX)
        .or_else(|| line.strip_prefix("0X"))
    {
        return match u64::from_str_radix(hex, 16) {
            Ok(0) => Inbound::Status(MotorStatus::Idle),
            Ok(_) => Inbound::Status(MotorStatus::Moving),
            Err(_) => Inbound::Message(line.to_string()),
        };
    }

    let value = match line.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => return Inbound::Message(line.to_string()),
    };

    if value < ERROR_CODE_BOUNDARY {
        // Codes are integral and 0-7; anything else is unexplained chatter
        if value.fract() == 0.0 && value >= 0.0 {
            if let Some(code) = ErrorCode::from_code(value as u8) {
                return Inbound::Code(code);
            }
        }
        return Inbound::Message(line.to_string());
    }

    Inbound::Wavelength(value)
}

/// Longest line accepted before the partial buffer is discarded.
pub const MAX_LINE_BYTES: usize = 4096;

/// Reassembles CRLF-terminated lines from arbitrary read chunks.
///
/// Bytes are held raw until a terminator arrives, so a UTF-8 sequence split
/// across reads decodes intact. A peer that never terminates a line cannot
/// grow the buffer past [`MAX_LINE_BYTES`].
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete, non-empty line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.pending.len() > MAX_LINE_BYTES {
            warn!(
                kind = "protocol",
                discarded = self.pending.len(),
                "unterminated OPO response exceeded {} bytes; discarding",
                MAX_LINE_BYTES
            );
            self.pending.clear();
        }
        lines
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(OpoCommand::Goto(750.0).to_line(), "GOTO 750.000\r\n");
        assert_eq!(OpoCommand::Goto(750.12345).to_string(), "GOTO 750.123");
        assert_eq!(OpoCommand::SetSpeed(1.5).to_string(), "SETSPD 1.500");
        assert_eq!(OpoCommand::TellWavelength.to_line(), "TELLWL\r\n");
        assert_eq!(OpoCommand::TellStatus.to_line(), "TELLSTAT\r\n");
        assert_eq!(OpoCommand::Close.to_string(), "CLOSE");
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_line("0x0"), Inbound::Status(MotorStatus::Idle));
        assert_eq!(classify_line("0x80085"), Inbound::Status(MotorStatus::Moving));
        assert_eq!(classify_line("0x00"), Inbound::Status(MotorStatus::Idle));
        assert!(matches!(classify_line("0xzz"), Inbound::Message(_)));
    }

    #[test]
    fn test_classify_codes_and_wavelengths() {
        assert_eq!(classify_line("0"), Inbound::Code(ErrorCode::Success));
        assert_eq!(classify_line("5"), Inbound::Code(ErrorCode::GotoAlreadyActive));
        assert_eq!(classify_line("7"), Inbound::Code(ErrorCode::NoVoltmeter));
        assert_eq!(classify_line("750.12345"), Inbound::Wavelength(750.12345));
        assert_eq!(classify_line("10"), Inbound::Wavelength(10.0));
    }

    #[test]
    fn test_classify_messages() {
        assert!(matches!(classify_line("client connected"), Inbound::Message(_)));
        assert!(matches!(classify_line("9"), Inbound::Message(_)));
        assert!(matches!(classify_line("2.5"), Inbound::Message(_)));
        assert!(matches!(classify_line("NaN"), Inbound::Message(_)));
    }

    #[test]
    fn test_error_code_table() {
        for code in 0..8u8 {
            let decoded = ErrorCode::from_code(code).unwrap();
            assert_eq!(decoded.code(), code);
            assert_eq!(decoded.is_fault(), code != 0);
        }
        assert!(ErrorCode::from_code(8).is_none());
        assert_eq!(
            ErrorCode::WindowNotOpen.to_string(),
            "Required Window Not Open"
        );
    }

    #[test]
    fn test_line_buffer_splits_concatenated_responses() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"0x0\r\n750.12345\r\n");
        assert_eq!(lines, vec!["0x0", "750.12345"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn test_line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"750.1").is_empty());
        assert_eq!(buf.pending(), b"750.1");
        assert_eq!(buf.push(b"2345\r"), Vec::<String>::new());
        assert_eq!(buf.push(b"\n0x"), vec!["750.12345"]);
        assert_eq!(buf.push(b"80085\r\n\r\n"), vec!["0x80085"]);
    }

    #[test]
    fn test_line_buffer_keeps_split_utf8_intact() {
        let mut buf = LineBuffer::new();
        let message = "λ locked\r\n".as_bytes();
        // Split inside the two-byte 'λ'
        assert!(buf.push(&message[..1]).is_empty());
        assert_eq!(buf.push(&message[1..]), vec!["λ locked"]);
    }

    #[test]
    fn test_line_buffer_discards_unterminated_flood() {
        let mut buf = LineBuffer::new();
        let flood = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(buf.push(&flood).is_empty());
        assert!(buf.pending().is_empty());

        // The stream recovers at the next terminated line
        assert_eq!(buf.push(b"yy\r\n750.5\r\n"), vec!["yy", "750.5"]);
    }
}
