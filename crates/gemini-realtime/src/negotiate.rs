//! One-shot fallback to a reduced capability set when setup is rejected.

use crate::{
    error::LiveError,
    transport::{CLOSE_ABNORMAL, CLOSE_POLICY_VIOLATION},
};
use parley_core::generic_types::ToolManifest;

/// What to do after the socket closed before the setup acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionOutcome {
    /// Reconnect once offering this reduced manifest.
    RetryWith(ToolManifest),
    /// Give up and surface the error.
    Fatal(LiveError),
}

/// Whether a close reason looks like the server refused part of the setup.
pub fn is_capability_rejection(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("invalid") || reason.contains("argument")
}

/// Human-readable description of a close.
pub fn describe_close(code: u16, reason: &str) -> String {
    match code {
        CLOSE_ABNORMAL if reason.is_empty() => "unexpected disconnect".to_string(),
        CLOSE_POLICY_VIOLATION => {
            if reason.is_empty() {
                "API key lacks access to the live model".to_string()
            } else {
                format!("API key lacks access to the live model: {reason}")
            }
        }
        _ if reason.is_empty() => format!("connection closed with code {code}"),
        _ => reason.to_string(),
    }
}

/// Decides between the single capability retry and a fatal rejection.
///
/// The retry budget lives on the session, not here, so that one engine
/// instance gets exactly one fallback across all of its connections.
#[derive(Debug, Default)]
pub struct CapabilityNegotiator;

impl CapabilityNegotiator {
    /// `retry_available` is consumed by the caller when the outcome is a retry.
    pub fn on_rejected_setup(
        &self,
        code: u16,
        reason: &str,
        offered: &ToolManifest,
        retry_available: bool,
    ) -> RejectionOutcome {
        if retry_available && is_capability_rejection(reason) {
            RejectionOutcome::RetryWith(offered.without_search())
        } else {
            RejectionOutcome::Fatal(LiveError::HandshakeRejected {
                code,
                reason: describe_close(code, reason),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::generic_types::FunctionDeclaration;

    fn full_manifest() -> ToolManifest {
        ToolManifest {
            functions: vec![FunctionDeclaration {
                name: "list_directory".into(),
                description: String::new(),
                parameters: None,
            }],
            google_search: true,
        }
    }

    #[test]
    fn reason_matching_is_case_insensitive() {
        assert!(is_capability_rejection("Request contains an INVALID argument."));
        assert!(is_capability_rejection("argument rejected"));
        assert!(!is_capability_rejection("quota exceeded"));
        assert!(!is_capability_rejection(""));
    }

    #[test]
    fn first_invalid_argument_retries_without_search() {
        let outcome =
            CapabilityNegotiator.on_rejected_setup(1007, "invalid argument", &full_manifest(), true);
        let RejectionOutcome::RetryWith(reduced) = outcome else {
            panic!("expected a retry");
        };
        assert!(!reduced.google_search);
        assert_eq!(reduced.functions, full_manifest().functions);
    }

    #[test]
    fn retry_is_not_offered_twice() {
        let outcome =
            CapabilityNegotiator.on_rejected_setup(1007, "invalid argument", &full_manifest(), false);
        assert_eq!(
            outcome,
            RejectionOutcome::Fatal(LiveError::HandshakeRejected {
                code: 1007,
                reason: "invalid argument".into()
            })
        );
    }

    #[test]
    fn unrelated_rejections_are_fatal_with_described_reason() {
        let RejectionOutcome::Fatal(LiveError::HandshakeRejected { reason, .. }) =
            CapabilityNegotiator.on_rejected_setup(1008, "", &full_manifest(), true)
        else {
            panic!("expected fatal");
        };
        assert!(reason.contains("lacks access"));
        assert_eq!(describe_close(1006, ""), "unexpected disconnect");
        assert_eq!(describe_close(1000, ""), "connection closed with code 1000");
    }
}
