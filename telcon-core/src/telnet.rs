//! Telnet in-band control sequence filter.
//!
//! Strips IAC command sequences (RFC 854) from the inbound byte stream so
//! only user-typed text reaches the line assembler. Option negotiation is
//! never answered; every control sequence is silently consumed.
//!
//! ```text
//!            IAC                      WILL/WONT/DO/DONT
//!  Normal ────────► AwaitingCommand ──────────────────► AwaitingOption
//!    ▲                    │ any other code                    │ option
//!    └────────────────────┴───────────────────────────────────┘
//! ```

/// Interpret As Command: starts every control sequence.
pub const IAC: u8 = 255;
/// Refuse to perform, or continue performing, an option.
pub const DONT: u8 = 254;
/// Request the other side to perform an option.
pub const DO: u8 = 253;
/// Refuse to perform an option.
pub const WONT: u8 = 252;
/// Offer to perform an option.
pub const WILL: u8 = 251;

/// Returns `true` for the four option negotiation codes, which are always
/// followed by a single option byte.
pub fn is_negotiation(code: u8) -> bool {
    matches!(code, WILL | WONT | DO | DONT)
}

// ── FilterState ──────────────────────────────────────────────────

/// Where the filter is inside a control sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterState {
    /// Plain data; bytes pass through.
    #[default]
    Normal,

    /// IAC seen; the next byte is a command code.
    AwaitingCommand,

    /// Negotiation code seen; the next byte is the option identifier.
    AwaitingOption,
}

impl std::fmt::Display for FilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::AwaitingCommand => write!(f, "AwaitingCommand"),
            Self::AwaitingOption => write!(f, "AwaitingOption"),
        }
    }
}

// ── TelnetFilter ─────────────────────────────────────────────────

/// Byte-at-a-time IAC stripper. State survives across reads, so a
/// sequence split over two TCP segments is still removed.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: FilterState,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Feed one byte. Returns the byte when it is user data, `None` when
    /// it was consumed as part of a control sequence.
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        match self.state {
            FilterState::Normal => {
                if byte == IAC {
                    self.state = FilterState::AwaitingCommand;
                    None
                } else {
                    Some(byte)
                }
            }
            FilterState::AwaitingCommand => {
                self.state = if is_negotiation(byte) {
                    FilterState::AwaitingOption
                } else {
                    FilterState::Normal
                };
                None
            }
            FilterState::AwaitingOption => {
                self.state = FilterState::Normal;
                None
            }
        }
    }

    /// Back to `Normal`, for a fresh connection.
    pub fn reset(&mut self) {
        self.state = FilterState::Normal;
    }
}

// ── Tests ────────────────────────────────────────────────────────
