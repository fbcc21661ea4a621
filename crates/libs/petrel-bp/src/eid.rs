use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EidError {
    #[error("endpoint id missing ':' separator: {0}")]
    NoSeparator(String),

    #[error("endpoint id has empty scheme: {0}")]
    EmptyScheme(String),

    #[error("endpoint id contains invalid characters")]
    BadCharacters,
}

/// A URI-style endpoint identifier: `scheme:ssp`.
///
/// An `EndpointId` doubles as a pattern. The wildcard scheme `*` matches any
/// scheme; within the `dtn` scheme an SSP of `*` matches everything and an
/// SSP ending in `/*` matches by prefix. Other schemes match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    scheme: String,
    ssp: String,
}

impl EndpointId {
    pub fn parse(s: &str) -> Result<Self, EidError> {
        let (scheme, ssp) =
            s.split_once(':').ok_or_else(|| EidError::NoSeparator(s.to_string()))?;
        if scheme.is_empty() {
            return Err(EidError::EmptyScheme(s.to_string()));
        }
        if s.bytes().any(|b| b == 0 || b.is_ascii_whitespace()) {
            return Err(EidError::BadCharacters);
        }
        Ok(Self { scheme: scheme.to_string(), ssp: ssp.to_string() })
    }

    /// The null endpoint, `dtn:none`.
    pub fn null() -> Self {
        Self { scheme: "dtn".to_string(), ssp: "none".to_string() }
    }

    pub fn is_null(&self) -> bool {
        self.scheme == "dtn" && self.ssp == "none"
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn ssp(&self) -> &str {
        &self.ssp
    }

    /// Append a demux token to the SSP, e.g. `dtn://node` + `ping` ->
    /// `dtn://node/ping`.
    pub fn with_service(&self, service: &str) -> Self {
        let mut ssp = self.ssp.clone();
        if !ssp.ends_with('/') {
            ssp.push('/');
        }
        ssp.push_str(service);
        Self { scheme: self.scheme.clone(), ssp }
    }

    /// Treat `self` as a pattern and test `eid` against it.
    pub fn matches(&self, eid: &EndpointId) -> bool {
        if self.scheme != "*" && self.scheme != eid.scheme {
            return false;
        }
        if self.ssp == "*" {
            return true;
        }
        if let Some(prefix) = self.ssp.strip_suffix("/*") {
            return eid.ssp == prefix || eid.ssp.starts_with(&format!("{prefix}/"));
        }
        self.ssp == eid.ssp
    }

    /// True when the pattern admits wildcard matching.
    pub fn is_pattern(&self) -> bool {
        self.scheme == "*" || self.ssp == "*" || self.ssp.ends_with("/*")
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        EndpointId::null()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.ssp)
    }
}

impl std::str::FromStr for EndpointId {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let eid = EndpointId::parse("dtn://node/app").expect("parse");
        assert_eq!(eid.scheme(), "dtn");
        assert_eq!(eid.ssp(), "//node/app");
        assert_eq!(eid.to_string(), "dtn://node/app");
    }

    #[test]
    fn rejects_malformed() {
        assert!(EndpointId::parse("no-separator").is_err());
        assert!(EndpointId::parse(":ssp-only").is_err());
        assert!(EndpointId::parse("dtn: spaced").is_err());
    }

    #[test]
    fn null_endpoint() {
        let null = EndpointId::null();
        assert!(null.is_null());
        assert_eq!(null.to_string(), "dtn:none");
    }

    #[test]
    fn exact_match() {
        let pat = EndpointId::parse("dtn://node/app").expect("parse");
        let eid = EndpointId::parse("dtn://node/app").expect("parse");
        assert!(pat.matches(&eid));
        assert!(!pat.matches(&EndpointId::parse("dtn://node/other").expect("parse")));
    }

    #[test]
    fn wildcard_ssp() {
        let pat = EndpointId::parse("dtn:*").expect("parse");
        assert!(pat.matches(&EndpointId::parse("dtn://anything/at/all").expect("parse")));
        assert!(!pat.matches(&EndpointId::parse("ipn:1.2").expect("parse")));
    }

    #[test]
    fn wildcard_scheme() {
        let pat = EndpointId::parse("*:*").expect("parse");
        assert!(pat.matches(&EndpointId::parse("ipn:1.2").expect("parse")));
    }

    #[test]
    fn prefix_match() {
        let pat = EndpointId::parse("dtn://node/*").expect("parse");
        assert!(pat.matches(&EndpointId::parse("dtn://node/app").expect("parse")));
        assert!(pat.matches(&EndpointId::parse("dtn://node").expect("parse")));
        assert!(!pat.matches(&EndpointId::parse("dtn://nodeling/app").expect("parse")));
    }

    #[test]
    fn with_service() {
        let eid = EndpointId::parse("dtn://node").expect("parse");
        assert_eq!(eid.with_service("ping").to_string(), "dtn://node/ping");
    }
}
