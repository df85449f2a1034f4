use std::{fmt::Display, num::ParseIntError, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

/// Error variants which can be encountered when parsing a [`UnitId`].
#[derive(Debug, PartialEq, Snafu)]
pub enum ParseUnitIdError {
    #[snafu(display("unit name {input:?} is missing the {separator:?} separator"))]
    MissingSeparator { input: String, separator: char },

    #[snafu(display("unit name {input:?} has an empty application name"))]
    EmptyAppName { input: String },

    #[snafu(display("failed to parse unit number of {input:?}"))]
    ParseUnitNumber {
        source: ParseIntError,
        input: String,
    },
}

/// Identity of one unit of an application, formatted as `<app>/<number>`.
///
/// On Kubernetes the unit number is the StatefulSet ordinal and numbers are sequential. On
/// machines unit numbers are not guaranteed to be sequential.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId {
    pub app_name: String,
    pub number: u32,
}

impl UnitId {
    pub fn new(app_name: impl Into<String>, number: u32) -> Self {
        Self {
            app_name: app_name.into(),
            number,
        }
    }

    /// Converts a Kubernetes pod name (`mysql-router-k8s-2`) into a unit id
    /// (`mysql-router-k8s/2`).
    pub fn from_pod_name(pod_name: &str) -> Result<Self, ParseUnitIdError> {
        Self::parse_with_separator(pod_name, '-')
    }

    /// The Kubernetes pod name of this unit.
    pub fn pod_name(&self) -> String {
        format!("{app}-{number}", app = self.app_name, number = self.number)
    }

    fn parse_with_separator(input: &str, separator: char) -> Result<Self, ParseUnitIdError> {
        let (app_name, number) = input
            .rsplit_once(separator)
            .context(MissingSeparatorSnafu { input, separator })?;

        if app_name.is_empty() {
            return EmptyAppNameSnafu { input }.fail();
        }

        let number = number.parse().context(ParseUnitNumberSnafu { input })?;
        Ok(Self::new(app_name, number))
    }
}

impl FromStr for UnitId {
    type Err = ParseUnitIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse_with_separator(input.trim(), '/')
    }
}

impl TryFrom<String> for UnitId {
    type Error = ParseUnitIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitId> for String {
    fn from(value: UnitId) -> Self {
        value.to_string()
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_name, self.number)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("mysql-router-k8s/0", UnitId::new("mysql-router-k8s", 0))]
    #[case("router/12", UnitId::new("router", 12))]
    #[case(" router/3 ", UnitId::new("router", 3))]
    fn parse_unit_name(#[case] input: &str, #[case] expected: UnitId) {
        let unit: UnitId = input.parse().expect("valid unit name");
        assert_eq!(unit, expected);
    }

    #[rstest]
    #[case("router")]
    #[case("/1")]
    #[case("router/one")]
    fn parse_invalid_unit_name(#[case] input: &str) {
        input.parse::<UnitId>().expect_err("invalid unit name");
    }

    #[test]
    fn pod_name_round_trips() {
        let unit = UnitId::from_pod_name("mysql-router-k8s-2").expect("valid pod name");
        assert_eq!(unit, UnitId::new("mysql-router-k8s", 2));
        assert_eq!(unit.pod_name(), "mysql-router-k8s-2");
        assert_eq!(unit.to_string(), "mysql-router-k8s/2");
    }
}
