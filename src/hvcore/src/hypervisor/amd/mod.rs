//! This module implements the AMD Secure Virtual Machine (SVM) specifics.

pub(crate) mod consistency;
pub(crate) mod exit;
pub(crate) mod npts;
pub(crate) mod svm;
pub(crate) mod vmcb;
