// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scratch command block for the lowest-level engine interface.

/// Requests accepted by [`crate::Engine::ioctl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Send, or estimate a send when `obj`-style fields ask for it
    Send,
}

/// The subset of the kernel command structure the send estimate needs.
/// `Default` gives the zero-initialized block the kernel expects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawCommand {
    /// Dataset the command targets
    pub name: String,
    /// Secondary name; carries the incremental base for sends
    pub value: String,
    pub cookie: u64,
    /// Non-zero when the send is relative to the dataset's origin
    pub obj: u64,
    pub sendobj: u64,
    pub fromobj: u64,
    pub guid: u64,
    pub flags: u64,
    /// Output slot: the estimated stream size after a size query
    pub objset_type: u64,
}

impl RawCommand {
    pub fn new(name: impl Into<String>) -> Self {
        RawCommand {
            name: name.into(),
            ..Default::default()
        }
    }
}
