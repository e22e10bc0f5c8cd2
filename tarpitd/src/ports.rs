//! Port specification strings: comma separated ports and inclusive
//! `begin-end` ranges, e.g. `"22, 80, 8000-8100"`.

use std::collections::BTreeSet;
use std::str::FromStr;
use crate::error::TarpitError;

/// Deduplicated, ascending set of usable ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet(BTreeSet<u16>);

impl PortSet {
    /// Parse without validating. Segments that are malformed, zero, or
    /// inverted contribute nothing.
    pub fn parse_lenient(spec: &str) -> Self {
        let mut ports = BTreeSet::new();
        for segment in segments(spec) {
            if let Ok((begin, end)) = parse_segment(segment) {
                ports.extend(begin..=end);
            }
        }
        Self(ports)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for PortSet {
    type Err = TarpitError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        validate(spec)?;
        Ok(Self::parse_lenient(spec))
    }
}

impl IntoIterator for PortSet {
    type Item = u16;
    type IntoIter = std::collections::btree_set::IntoIter<u16>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Check a port specification, naming the first bad segment.
pub fn validate(spec: &str) -> Result<(), TarpitError> {
    let invalid = |reason: String| TarpitError::InvalidPorts {
        spec: spec.to_string(),
        reason,
    };

    let mut any = false;
    for segment in segments(spec) {
        any = true;
        parse_segment(segment).map_err(invalid)?;
    }

    if !any {
        return Err(invalid("no ports given".to_string()));
    }
    Ok(())
}

fn segments(spec: &str) -> impl Iterator<Item = &str> {
    spec.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_segment(segment: &str) -> Result<(u16, u16), String> {
    match segment.split_once('-') {
        Some((begin, end)) => {
            let begin = parse_port(begin);
            let end = parse_port(end);
            match (begin, end) {
                (Some(begin), Some(end)) if begin <= end => Ok((begin, end)),
                _ => Err(format!("invalid port range {segment}")),
            }
        }
        None => parse_port(segment)
            .map(|port| (port, port))
            .ok_or_else(|| format!("invalid port {segment}")),
    }
}

/// Zero and anything that is not a 16-bit number are unusable.
fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse::<u16>().ok().filter(|&port| port != 0)
}
