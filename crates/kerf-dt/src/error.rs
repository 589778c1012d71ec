//! Codec error types

use thiserror::Error;

/// Everything that can go wrong turning text or bytes into a tree, or a
/// tree into a resource model. Always fatal: nothing is validated from a
/// document that failed to decode.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{line}:{col}: {message}")]
    Syntax {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("input truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u32),

    #[error("malformed blob at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("{path}: reference to undefined label &{label}")]
    DanglingReference { label: String, path: String },

    #[error("label '{label}' is defined more than once")]
    DuplicateLabel { label: String },

    #[error("{path}: node name is reserved for the blob label table")]
    ReservedNode { path: String },

    #[error("baseline documents must not contain /instances")]
    InstancesInBaseline,

    #[error("{path}: missing node")]
    MissingNode { path: String },

    #[error("{path}: missing property '{name}'")]
    MissingProperty { path: String, name: String },

    #[error("{path}: property '{name}' {reason}")]
    BadProperty {
        path: String,
        name: String,
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn syntax(line: usize, col: usize, message: impl Into<String>) -> Self {
        DecodeError::Syntax {
            line,
            col,
            message: message.into(),
        }
    }

    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_property(
        path: impl Into<String>,
        name: &str,
        reason: impl Into<String>,
    ) -> Self {
        DecodeError::BadProperty {
            path: path.into(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
