//! Security - authentication status and the section trust hook

pub mod trust;

pub use trust::{
    AuthStatus, RejectFailedVerification, RequireSignedImages, SectionTrustEvaluator,
    TrustDecision,
};
