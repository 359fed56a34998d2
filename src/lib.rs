// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workspace umbrella for the OpenClaw control plane.
//!
//! The root package only hosts the cross-crate integration tests under
//! `tests/`; all functionality lives in the `crates/ocw-*` members.
#![deny(unsafe_code)]
