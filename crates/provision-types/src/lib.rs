// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the provisioning crates.
//!
//! This crate defines the declarative inputs of a cluster create (requests
//! and options) and the reflected view of a running cluster (cluster, network
//! and node info) such that the provisioner library, the service launchers
//! and the command-line frontend can all agree on them without depending on
//! each other.

mod info;
mod options;
mod request;

pub use info::*;
pub use options::*;
pub use request::*;

use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Errors raised while validating a request before anything is provisioned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("network must have at least one CIDR")]
    NoCidrs,

    #[error("network has {cidrs} CIDRs but {gateways} gateway addresses")]
    GatewayCount { cidrs: usize, gateways: usize },

    #[error("gateway {gateway} is not contained in CIDR {cidr}")]
    GatewayOutsideCidr { gateway: IpAddr, cidr: IpNetwork },

    #[error("MTU must be positive")]
    InvalidMtu,

    #[error("bandwidth and other chaos options cannot be used together")]
    ChaosConflict,

    #[error("packet {knob} probability {value} is outside 0..=100")]
    ChaosProbability { knob: &'static str, value: String },

    #[error("duplicate node name {0:?}")]
    DuplicateNodeName(String),

    #[error(
        "node {node:?} has {ips} IPs but the network has {cidrs} CIDRs"
    )]
    IpCountMismatch { node: String, ips: usize, cidrs: usize },

    #[error("node {node:?}: IP {ip} is not contained in CIDR {cidr}")]
    IpOutsideCidr { node: String, ip: IpAddr, cidr: IpNetwork },

    #[error("at least one disk is required")]
    NoDisks,

    #[error("node {node:?}: {what} must be positive")]
    NonPositiveResource { node: String, what: &'static str },

    #[error("node {node:?}: disk {index} size must be positive")]
    EmptyDisk { node: String, index: usize },

    #[error("node {node:?}: virtiofs disk {index} requires a share directory")]
    VirtiofsWithoutShare { node: String, index: usize },

    #[error("invalid boot order {0:?}")]
    InvalidBootOrder(String),
}
