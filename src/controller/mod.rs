//! # Controllers
//!
//! Two independent reconcile loops share the CA repository:
//!
//! - [`ServiceCertController`] keeps serving-certificate Secrets current
//! - [`CaRotationController`] rotates the signing CA through a cross-signed
//!   overlap window
//!
//! Neither holds authoritative state in memory. Everything they decide is
//! re-derived from the store on the next tick.

pub mod ca_rotation;
pub mod service_cert;

pub use ca_rotation::{CaRotationController, RotationOutcome};
pub use service_cert::{
    CertState, IdentityStatus, ReconcileOutcome, ResyncSummary, ServiceCertController,
};
