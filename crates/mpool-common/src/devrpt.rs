//! Device report
//!
//! Operations that touch devices fill in a caller-owned report in addition
//! to returning an error, so callers can tell which argument was at fault.

use std::fmt;

/// Maximum message length in bytes
pub const DEVRPT_MSG_MAX: usize = 120;

/// Reason codes carried by a device report
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DevRptReason {
    #[default]
    None = 0,
    /// The message field holds the explanation
    ErrMsg = 1,
    /// Unable to open
    Open = 2,
    /// Invalid parameter
    Parm = 3,
    /// Device is already formatted
    Magic = 4,
    /// Unable to stat
    Stat = 5,
    /// Out of memory
    ENoMem = 6,
    /// Device read or write failed
    DevRw = 7,
    /// Pool is not activated
    NotActivated = 8,
    /// Device already activated
    DevActivated = 9,
    /// No such pool device
    MpNoDev = 10,
    /// Invalid device
    InvalDev = 11,
    /// Pool already exists
    MpExist = 12,
    /// Invalid entity name
    EntNamInv = 13,
}

impl DevRptReason {
    /// Short description of the reason
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "no error",
            Self::ErrMsg => "see message",
            Self::Open => "unable to open",
            Self::Parm => "invalid parameter",
            Self::Magic => "device already formatted",
            Self::Stat => "unable to stat",
            Self::ENoMem => "out of memory",
            Self::DevRw => "device read/write failed",
            Self::NotActivated => "pool not activated",
            Self::DevActivated => "device already activated",
            Self::MpNoDev => "no such pool device",
            Self::InvalDev => "invalid device",
            Self::MpExist => "pool already exists",
            Self::EntNamInv => "invalid entity name",
        }
    }
}

impl fmt::Display for DevRptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation device report
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceReport {
    reason: DevRptReason,
    arg_offset: i32,
    message: String,
}

impl Default for DeviceReport {
    fn default() -> Self {
        Self {
            reason: DevRptReason::None,
            arg_offset: -1,
            message: String::new(),
        }
    }
}

impl DeviceReport {
    /// Create an empty report
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to the empty state
    pub fn init(&mut self) {
        *self = Self::default();
    }

    /// Record a failure attributed to argument `arg_offset` (-1 for none).
    /// The first non-`None` reason wins.
    pub fn set(&mut self, reason: DevRptReason, arg_offset: i32) {
        if self.reason != DevRptReason::None || reason == DevRptReason::None {
            return;
        }
        self.reason = reason;
        self.arg_offset = arg_offset;
    }

    /// Record a free-form failure message, truncated to [`DEVRPT_MSG_MAX`]
    pub fn set_msg(&mut self, msg: impl AsRef<str>, arg_offset: i32) {
        if self.reason != DevRptReason::None {
            return;
        }
        let msg = msg.as_ref();
        let mut end = msg.len().min(DEVRPT_MSG_MAX);
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        self.reason = DevRptReason::ErrMsg;
        self.arg_offset = arg_offset;
        self.message = msg[..end].to_string();
    }

    /// Reason code
    #[must_use]
    pub const fn reason(&self) -> DevRptReason {
        self.reason
    }

    /// Offending argument index, or -1
    #[must_use]
    pub const fn arg_offset(&self) -> i32 {
        self.arg_offset
    }

    /// Message (only meaningful for [`DevRptReason::ErrMsg`])
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a failure has been recorded
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.reason != DevRptReason::None
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            DevRptReason::ErrMsg => write!(f, "{}", self.message),
            reason if self.arg_offset >= 0 => write!(f, "{} (arg {})", reason, self.arg_offset),
            reason => write!(f, "{}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_empty() {
        let mut rpt = DeviceReport::new();
        rpt.set(DevRptReason::Open, 2);
        rpt.init();
        assert_eq!(rpt.reason(), DevRptReason::None);
        assert_eq!(rpt.arg_offset(), -1);
        assert!(!rpt.is_set());
    }

    #[test]
    fn test_first_reason_wins() {
        let mut rpt = DeviceReport::new();
        rpt.set(DevRptReason::None, 4);
        assert!(!rpt.is_set());

        rpt.set(DevRptReason::Magic, 0);
        rpt.set(DevRptReason::Stat, 1);
        rpt.set_msg("later", 3);
        assert_eq!(rpt.reason(), DevRptReason::Magic);
        assert_eq!(rpt.arg_offset(), 0);
        assert_eq!(rpt.to_string(), "device already formatted (arg 0)");
    }

    #[test]
    fn test_message_truncated_on_char_boundary() {
        let mut rpt = DeviceReport::new();
        let msg = "é".repeat(100);
        rpt.set_msg(&msg, -1);
        assert_eq!(rpt.reason(), DevRptReason::ErrMsg);
        assert!(rpt.message().len() <= DEVRPT_MSG_MAX);
        assert_eq!(rpt.message().len(), 120);
    }
}
