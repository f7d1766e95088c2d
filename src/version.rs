use memflow::prelude::v1::*;

use std::ops::RangeInclusive;
use std::str::FromStr;

/// Darwin kernel version, e.g. `22.4.0` for iOS 16.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: usize,
    pub minor: usize,
    pub point: usize,
}

impl KernelVersion {
    pub const MAX: KernelVersion = KernelVersion::new(usize::MAX, usize::MAX, usize::MAX);

    pub const fn new(major: usize, minor: usize, point: usize) -> Self {
        Self {
            major,
            minor,
            point,
        }
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{}.{}.{}", self.major, self.minor, self.point)
    }
}

impl FromStr for KernelVersion {
    type Err = Error;

    /// Parses `major[.minor[.point]]`. Missing components are zero, trailing
    /// non-numeric noise after the point component (`22.4.0b1`) is ignored.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, '.');

        let mut next = |required: bool| -> Result<usize> {
            match parts.next() {
                Some(p) => {
                    let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
                    digits
                        .parse()
                        .map_err(|_| Error(ErrorOrigin::OsLayer, ErrorKind::Encoding))
                }
                None if required => Err(Error(ErrorOrigin::OsLayer, ErrorKind::Encoding)),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let point = next(false)?;

        Ok(Self::new(major, minor, point))
    }
}

impl From<(usize, usize, usize)> for KernelVersion {
    fn from((major, minor, point): (usize, usize, usize)) -> Self {
        Self::new(major, minor, point)
    }
}

/// Inclusive range of kernel versions a table entry applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRange {
    range: RangeInclusive<KernelVersion>,
}

impl VersionRange {
    /// Every version from `start` onwards.
    pub fn at_least(start: impl Into<KernelVersion>) -> Self {
        Self {
            range: start.into()..=KernelVersion::MAX,
        }
    }

    /// A single version, used for narrow regression windows.
    pub fn exactly(version: impl Into<KernelVersion>) -> Self {
        let version = version.into();
        Self {
            range: version..=version,
        }
    }

    pub fn contains(&self, version: &KernelVersion) -> bool {
        self.range.contains(version)
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        if self.range.start() == self.range.end() {
            write!(f, "{}", self.range.start())
        } else if *self.range.end() == KernelVersion::MAX {
            write!(f, ">={}", self.range.start())
        } else {
            write!(f, "{}-{}", self.range.start(), self.range.end())
        }
    }
}

impl PartialEq<KernelVersion> for VersionRange {
    fn eq(&self, version: &KernelVersion) -> bool {
        self.contains(version)
    }
}

impl From<(usize, usize, usize)> for VersionRange {
    fn from(version: (usize, usize, usize)) -> Self {
        Self::exactly(version)
    }
}

impl From<RangeInclusive<KernelVersion>> for VersionRange {
    fn from(range: RangeInclusive<KernelVersion>) -> Self {
        Self { range }
    }
}

/// Identity of the running kernel build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelBuild {
    pub version: KernelVersion,
    /// Pointer authentication is available (arm64e).
    pub arm64e: bool,
    /// The kernelcache is an `MH_FILESET` of independently linked images.
    pub fileset: bool,
}

impl KernelBuild {
    pub fn new(version: &str, arm64e: bool, fileset: bool) -> Result<Self> {
        Ok(Self {
            version: version.parse()?,
            arm64e,
            fileset,
        })
    }

    pub fn is_at_least(&self, version: impl Into<KernelVersion>) -> bool {
        self.version >= version.into()
    }
}

impl std::fmt::Display for KernelBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(
            f,
            "Darwin {} ({}{})",
            self.version,
            if self.arm64e { "arm64e" } else { "arm64" },
            if self.fileset { ", fileset" } else { "" }
        )
    }
}
