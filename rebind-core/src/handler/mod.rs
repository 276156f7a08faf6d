/*!
Failure policies for rebind and persistence runs.

A fresh handler is built for every rebind pass and every persistence flush.
Each failure category is routed through a [`RebindFailureMode`] which decides
whether the run aborts at once, collects the failure and raises it at the end,
or only logs it.
*/

use serde::{Deserialize, Serialize};

pub mod persistence;
pub mod rebind;

pub use persistence::{DefaultPersistenceExceptionHandler, PersistenceExceptionHandler, WarnedIds};
pub use rebind::{
    DefaultRebindExceptionHandler, RebindExceptionHandler, RebindHandlerBuilder, RebindPass,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebindFailureMode {
    /// Abort on the first failure
    FailFast,
    /// Keep going, then raise every collected failure
    FailAtEnd,
    /// Log and keep going
    Continue,
}

impl RebindFailureMode {
    pub fn default_dangling_ref() -> Self {
        RebindFailureMode::Continue
    }

    pub fn default_rebind() -> Self {
        RebindFailureMode::FailAtEnd
    }

    pub fn default_add_policy() -> Self {
        RebindFailureMode::Continue
    }

    pub fn default_load_policy() -> Self {
        RebindFailureMode::Continue
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RebindFailureMode::FailFast => "FAIL_FAST",
            RebindFailureMode::FailAtEnd => "FAIL_AT_END",
            RebindFailureMode::Continue => "CONTINUE",
        }
    }
}

impl std::fmt::Display for RebindFailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RebindFailureMode {
    type Err = crate::PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FAIL_FAST" => Ok(RebindFailureMode::FailFast),
            "FAIL_AT_END" => Ok(RebindFailureMode::FailAtEnd),
            "CONTINUE" => Ok(RebindFailureMode::Continue),
            other => Err(crate::PersistError::validation(format!(
                "Unknown failure mode: {other}"
            ))),
        }
    }
}
