//! Shared library for Waggle node identity.
//!
//! This crate provides:
//! - Credential bundle storage (CA certificate, node certificate, key, reverse tunnel port)
//! - Enrollment with the beehive certificate authority over HTTP or SSH
//! - A supervised enrollment loop that retries until the bundle exists

mod certs;
mod enrollment;
mod error;
pub mod pem;
mod ssh;

pub use certs::{CredentialStore, IdentityBundle};
pub use enrollment::{
    EnrollmentClient, EnrollmentOutcome, EnrollmentTransport, LocalCertServer, SshCertServer,
    parse_bundle, run_enrollment_loop,
};
pub use error::Error;
pub use pem::BlockPolicy;
pub use ssh::SshConfig;

pub type Result<T, E = Error> = std::result::Result<T, E>;
