use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Locally minted identifier: `<prefix>_<uuid v7>`, so ids sort by creation.
macro_rules! prefixed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id!(
    /// Key of a stored session. Callers may also supply their own.
    SessionId,
    "sess"
);
prefixed_id!(
    /// Pairs a tool call with its result.
    ToolCallId,
    "call"
);
prefixed_id!(
    /// Correlates the log lines of one orchestration.
    RunId,
    "run"
);

/// Opaque, backend-issued handle that resumes a prior conversation.
///
/// Never generated locally: the only way to obtain one is from a backend
/// response, and it is forwarded back verbatim.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn from_backend(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
