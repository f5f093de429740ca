use std::fmt;

use smol_str::SmolStr;

use crate::{params::Params, uri::SipUri};

/// Route / Record-Route header value (`<sip:...;lr>;params`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHeader {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    pub params: Params,
}

impl RouteHeader {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    /// Parses one route entry; bare URIs without angle brackets are accepted.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        match input.find('<') {
            Some(open) => {
                let close = input[open..].find('>')? + open;
                let display = input[..open].trim().trim_matches('"').trim();
                Some(Self {
                    display_name: (!display.is_empty()).then(|| SmolStr::new(display)),
                    uri: SipUri::parse(&input[open + 1..close])?,
                    params: Params::parse(input[close + 1..].trim_start_matches(';')),
                })
            }
            None => Some(Self::new(SipUri::parse(input)?)),
        }
    }

    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    /// Loose routing marker (`;lr`) on the URI.
    pub fn is_loose(&self) -> bool {
        self.uri.params.contains("lr")
    }
}

impl fmt::Display for RouteHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_route() {
        let route = RouteHeader::parse("<sip:proxy.example.com:5070;transport=tcp;lr>").unwrap();
        assert_eq!(route.uri.host.as_str(), "proxy.example.com");
        assert_eq!(route.uri.port, Some(5070));
        assert!(route.is_loose());
    }

    #[test]
    fn display_wraps_uri() {
        let uri = SipUri::new("10.0.0.1")
            .with_port(Some(5060))
            .with_param("transport", Some("udp"))
            .with_param("lr", None);
        assert_eq!(
            RouteHeader::new(uri).to_string(),
            "<sip:10.0.0.1:5060;transport=udp;lr>"
        );
    }
}
