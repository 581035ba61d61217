use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::Error;

/// A Kubernetes `major.minor.patch` version; a leading `v` and pre-release suffixes are accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KubernetesVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KubernetesVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// `self >= major.minor`
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^v?(\d+)\.(\d+)(?:\.(\d+))?(?:[-+].*)?$").expect("static regex is valid")
    })
}

impl FromStr for KubernetesVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = version_regex()
            .captures(s.trim())
            .ok_or_else(|| Error::InvalidKubernetesVersion(s.into()))?;
        let part = |i: usize| -> Result<u32, Error> {
            captures
                .get(i)
                .map_or(Ok(0), |m| m.as_str().parse())
                .map_err(|_| Error::InvalidKubernetesVersion(s.into()))
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versions() {
        assert_eq!(
            "1.26.3".parse::<KubernetesVersion>().unwrap(),
            KubernetesVersion::new(1, 26, 3)
        );
        assert_eq!(
            "v1.29".parse::<KubernetesVersion>().unwrap(),
            KubernetesVersion::new(1, 29, 0)
        );
        assert_eq!(
            "1.30.1-gke.100".parse::<KubernetesVersion>().unwrap(),
            KubernetesVersion::new(1, 30, 1)
        );
        assert!("latest".parse::<KubernetesVersion>().is_err());
    }

    #[test]
    fn compares_minor_versions() {
        let v: KubernetesVersion = "1.26.0".parse().unwrap();
        assert!(v.at_least(1, 26));
        assert!(v.at_least(1, 25));
        assert!(!v.at_least(1, 27));
    }
}
