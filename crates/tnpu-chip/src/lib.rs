//! ABI model for the trusted NPU.
//!
//! This crate has **no dependencies** and **no hardware access**. It pins the
//! numbers shared between the control plane, the secure peer and the
//! access-control policy layer: device page geometry, completion status
//! bits, secure-peer command identifiers and result codes, and the
//! control-surface command numbers.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`page`] | Device page size, alignment helpers |
//! | [`status`] | Completion status register bits, interrupt timeout |
//! | [`ta`] | Trusted Application UUID, command ids, result codes, wire sizes |
//! | [`uapi`] | Control-surface request layouts and command numbers |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod page;
pub mod status;
pub mod ta;
pub mod uapi;
