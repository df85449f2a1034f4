//! Operator ("charm") and workload versions packaged with the operator.

use std::{
    fmt::Display,
    fs,
    num::ParseIntError,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use semver::Version;
use snafu::{OptionExt, ResultExt, Snafu};

pub const CHARM_VERSION_FILE: &str = "charm_version";
pub const WORKLOAD_VERSION_FILE: &str = "workload_version";

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(?P<major>\d+)(?:\.(?P<minor>\d+))?(?:\.(?P<patch>\d+))?(?:[-+~].*)?$")
        .expect("failed to compile version regex")
});

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read version file {path:?}"))]
    ReadVersionFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse version file {path:?}"))]
    ParseVersionFile {
        source: ParseVersionError,
        path: PathBuf,
    },
}

#[derive(Debug, PartialEq, Snafu)]
pub enum ParseVersionError {
    #[snafu(display("version {input:?} does not start with a numeric release"))]
    InvalidFormat { input: String },

    #[snafu(display("version component of {input:?} is out of range"))]
    ComponentOutOfRange {
        source: ParseIntError,
        input: String,
    },
}

/// Parses a version leniently into a [`Version`].
///
/// Missing minor and patch components default to zero and any pre-release, build or
/// distribution suffix (e.g. `8.0.36-0ubuntu0.22.04.1`) is ignored, so only the numeric release
/// takes part in comparisons.
pub fn parse_version(input: &str) -> Result<Version, ParseVersionError> {
    let input = input.trim();
    let captures = VERSION_REGEX
        .captures(input)
        .context(InvalidFormatSnafu { input })?;

    let component = |name: &str| -> Result<u64, ParseVersionError> {
        captures
            .name(name)
            .map_or(Ok(0), |value| value.as_str().parse())
            .context(ComponentOutOfRangeSnafu { input })
    };

    Ok(Version::new(
        component("major")?,
        component("minor")?,
        component("patch")?,
    ))
}

/// The versions of the operator and of the workload it ships, read once at process start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPair {
    pub charm: Version,
    pub workload: Version,
}

impl VersionPair {
    pub fn new(charm: Version, workload: Version) -> Self {
        Self { charm, workload }
    }

    /// Reads the `charm_version` and `workload_version` files from `directory`.
    ///
    /// Missing or unparsable files are a packaging defect, the operator cannot run without them.
    pub fn from_directory(directory: &Path) -> Result<Self, Error> {
        let read = |file_name: &str| -> Result<Version, Error> {
            let path = directory.join(file_name);
            let content = fs::read_to_string(&path).context(ReadVersionFileSnafu { path: &path })?;
            parse_version(&content).context(ParseVersionFileSnafu { path })
        };

        let versions = Self::new(read(CHARM_VERSION_FILE)?, read(WORKLOAD_VERSION_FILE)?);
        tracing::debug!(%versions, "read packaged versions");
        Ok(versions)
    }
}

impl Display for VersionPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "charm {} workload {}", self.charm, self.workload)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("8.0.36", Version::new(8, 0, 36))]
    #[case("8.0.36-0ubuntu0.22.04.1", Version::new(8, 0, 36))]
    #[case("v3", Version::new(3, 0, 0))]
    #[case("1.2\n", Version::new(1, 2, 0))]
    fn valid_version(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(parse_version(input).expect("valid version"), expected);
    }

    #[rstest]
    #[case("")]
    #[case("latest")]
    #[case("8.x")]
    fn invalid_version(#[case] input: &str) {
        parse_version(input).expect_err("invalid version");
    }

    #[test]
    fn reads_version_files() {
        let directory = tempfile::tempdir().expect("temporary directory");
        fs::write(directory.path().join(CHARM_VERSION_FILE), "7.1.0\n").expect("write file");
        fs::write(directory.path().join(WORKLOAD_VERSION_FILE), "8.0.36").expect("write file");

        let versions = VersionPair::from_directory(directory.path()).expect("valid version files");
        assert_eq!(
            versions,
            VersionPair::new(Version::new(7, 1, 0), Version::new(8, 0, 36))
        );
    }

    #[test]
    fn missing_version_file_fails() {
        let directory = tempfile::tempdir().expect("temporary directory");
        fs::write(directory.path().join(CHARM_VERSION_FILE), "7").expect("write file");

        let error = VersionPair::from_directory(directory.path()).expect_err("missing file");
        assert!(matches!(error, Error::ReadVersionFile { .. }));
    }
}
