use std::time::Duration;

use thiserror::Error;

use crate::wire::header::ProtocolId;


/// Conditions that callers are expected to tell apart. They travel inside `anyhow::Error` like
///  every other failure in this crate, and are recovered with
///  `err.downcast_ref::<DeciError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeciError {
    #[error("unexpected message protocol {actual_protocol:?} type 0x{actual_msg_type:x} (expected {expected_protocol:?} type 0x{expected_msg_type:x})")]
    ProtocolMismatch {
        actual_protocol: ProtocolId,
        actual_msg_type: i32,
        expected_protocol: ProtocolId,
        expected_msg_type: i32,
    },

    #[error("another system is controlling this device")]
    InUse,

    #[error("error 0x{result:x} (aux 0x{aux_error_code:x}) from {protocol:?} command type 0x{msg_type:x}")]
    CommandFailed {
        protocol: ProtocolId,
        msg_type: i32,
        result: i32,
        aux_error_code: i32,
    },

    /// NETMP answered in place of the sub-protocol, which is how the device rejects a command
    ///  it will not route
    #[error("command rejected by NETMP with message type 0x{msg_type:x}, result 0x{result:x}")]
    Rejected {
        msg_type: i32,
        result: i32,
    },

    #[error("{0} controller events were passed but at most 8 fit into one play data command")]
    TooManyEvents(usize),

    #[error("playback buffer on the device stayed full after {attempts} attempts")]
    BufferFull {
        attempts: u32,
    },

    #[error("connection taken over by another client")]
    ForcedDisconnect,

    #[error("connection aborted: {0}")]
    ConnectionAborted(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("connection was closed")]
    ConnectionClosed,

    #[error("no open link for {0:?}")]
    NotConnected(ProtocolId),

    #[error("{0:?} is not registered")]
    NotRegistered(ProtocolId),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl DeciError {
    /// convenience for tests and callers matching on a specific condition
    pub fn of(err: &anyhow::Error) -> Option<&DeciError> {
        err.downcast_ref::<DeciError>()
    }
}


/// Why a session stopped working. It is latched when the session goes down and re-raised to
///  every caller from then on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// orderly shutdown through disconnect
    Closed,
    ForcedDisconnect,
    Transport(String),
    Protocol(String),
}

impl AbortReason {
    pub fn to_error(&self) -> DeciError {
        match self {
            AbortReason::Closed => DeciError::ConnectionClosed,
            AbortReason::ForcedDisconnect => DeciError::ForcedDisconnect,
            AbortReason::Transport(msg) => DeciError::ConnectionAborted(msg.clone()),
            AbortReason::Protocol(msg) => DeciError::Framing(msg.clone()),
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = DeciError::InUse.into();
        assert_eq!(DeciError::of(&err), Some(&DeciError::InUse));

        let err = err.context("registering CTRLP");
        assert_eq!(DeciError::of(&err), Some(&DeciError::InUse));

        let other = anyhow!("something else");
        assert_eq!(DeciError::of(&other), None);
    }

    #[rstest]
    #[case::closed(AbortReason::Closed, DeciError::ConnectionClosed)]
    #[case::forced(AbortReason::ForcedDisconnect, DeciError::ForcedDisconnect)]
    #[case::transport(AbortReason::Transport("reset".to_string()), DeciError::ConnectionAborted("reset".to_string()))]
    #[case::protocol(AbortReason::Protocol("bad length".to_string()), DeciError::Framing("bad length".to_string()))]
    fn test_abort_reason_to_error(#[case] reason: AbortReason, #[case] expected: DeciError) {
        assert_eq!(reason.to_error(), expected);
    }

    #[test]
    fn test_display() {
        let err = DeciError::CommandFailed {
            protocol: ProtocolId::NETMP,
            msg_type: 6,
            result: 0x1006,
            aux_error_code: 0,
        };
        assert_eq!(err.to_string(), "error 0x1006 (aux 0x0) from 0x40001000(NETMP) command type 0x6");
    }
}
