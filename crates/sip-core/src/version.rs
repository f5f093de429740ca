use std::fmt;

/// Protocol version on request and status lines. Only `SIP/2.0` exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipVersion {
    V2,
}

impl SipVersion {
    pub const fn as_str(self) -> &'static str {
        match self {
            SipVersion::V2 => "SIP/2.0",
        }
    }

    /// Matches the version token of a start line, ignoring case.
    pub fn parse(token: &str) -> Option<Self> {
        token
            .trim()
            .eq_ignore_ascii_case(Self::V2.as_str())
            .then_some(Self::V2)
    }
}

impl fmt::Display for SipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(SipVersion::parse("sip/2.0 "), Some(SipVersion::V2));
        assert_eq!(SipVersion::parse("SIP/3.0"), None);
    }
}
