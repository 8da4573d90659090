//! Section trust evaluation
//!
//! Decoders report what they learned about a payload as [`AuthStatus`] bits.
//! The resolver hands the accumulated bits to the platform's
//! [`SectionTrustEvaluator`]; the policy itself belongs to the platform.

use core::fmt;

use bitflags::bitflags;
use uefi_raw::Guid;

bitflags! {
    /// Authentication status reported by section extractors
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct AuthStatus: u32 {
        /// Platform policy overrides the result
        const PLATFORM_OVERRIDE = 0x01;
        /// Payload carries a signature or checksum
        const IMAGE_SIGNED = 0x02;
        /// Payload was not verified
        const NOT_TESTED = 0x04;
        /// Verification ran and failed
        const TEST_FAILED = 0x08;
    }
}

impl AuthStatus {
    /// True when an extractor actually produced a verdict
    pub fn is_reported(self) -> bool {
        !self.is_empty()
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits())
    }
}

/// Outcome of a trust evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Continue with the payload
    Trusted,
    /// Abandon the payload and let the platform start recovery
    StartRecovery,
}

/// Platform trust policy for decoded sections
pub trait SectionTrustEvaluator {
    fn evaluate(&self, status: AuthStatus, originating_file: &Guid) -> TrustDecision;
}

/// Trust everything except a failed verification
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectFailedVerification;

impl SectionTrustEvaluator for RejectFailedVerification {
    fn evaluate(&self, status: AuthStatus, originating_file: &Guid) -> TrustDecision {
        if status.contains(AuthStatus::TEST_FAILED)
            && !status.contains(AuthStatus::PLATFORM_OVERRIDE)
        {
            log::warn!("file {} failed verification ({})", originating_file, status);
            return TrustDecision::StartRecovery;
        }
        TrustDecision::Trusted
    }
}

/// Trust only payloads that were signed and verified
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireSignedImages;

impl SectionTrustEvaluator for RequireSignedImages {
    fn evaluate(&self, status: AuthStatus, originating_file: &Guid) -> TrustDecision {
        if status.contains(AuthStatus::PLATFORM_OVERRIDE) {
            return TrustDecision::Trusted;
        }
        let verified = status.contains(AuthStatus::IMAGE_SIGNED)
            && !status.intersects(AuthStatus::NOT_TESTED | AuthStatus::TEST_FAILED);
        if verified {
            TrustDecision::Trusted
        } else {
            log::warn!("file {} is not verified ({})", originating_file, status);
            TrustDecision::StartRecovery
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: Guid = Guid::from_bytes([0x11; 16]);

    #[test]
    fn test_reject_failed_verification() {
        let policy = RejectFailedVerification;
        assert_eq!(policy.evaluate(AuthStatus::NOT_TESTED, &FILE), TrustDecision::Trusted);
        assert_eq!(
            policy.evaluate(AuthStatus::IMAGE_SIGNED | AuthStatus::TEST_FAILED, &FILE),
            TrustDecision::StartRecovery
        );
        assert_eq!(
            policy.evaluate(AuthStatus::TEST_FAILED | AuthStatus::PLATFORM_OVERRIDE, &FILE),
            TrustDecision::Trusted
        );
    }

    #[test]
    fn test_require_signed_images() {
        let policy = RequireSignedImages;
        assert_eq!(policy.evaluate(AuthStatus::IMAGE_SIGNED, &FILE), TrustDecision::Trusted);
        assert_eq!(policy.evaluate(AuthStatus::NOT_TESTED, &FILE), TrustDecision::StartRecovery);
        assert_eq!(policy.evaluate(AuthStatus::empty(), &FILE), TrustDecision::StartRecovery);
    }
}
