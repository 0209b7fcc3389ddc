//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn};

use crate::EndpointId;

// Egress gateway errors.
#[derive(Debug)]
pub enum Error {
    // Identity resolution
    InitialIdentitiesUnavailable,
    IdentityNotFound(u64),
    // Endpoint metadata
    EndpointMissingIpv4(EndpointId),
    // Host routing table
    Netlink(std::io::Error),
    // Startup
    UnsupportedKernel(String),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::InitialIdentitiesUnavailable => {
                warn!("{}", self);
            }
            Error::IdentityNotFound(identity) => {
                warn!(%identity, "{}", self);
            }
            Error::EndpointMissingIpv4(endpoint) => {
                error!(endpoint = %endpoint, "{}", self);
            }
            Error::Netlink(error) => {
                warn!(%error, "{}", self);
            }
            Error::UnsupportedKernel(release) => {
                error!(%release, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InitialIdentitiesUnavailable => {
                write!(f, "initial identities not yet available")
            }
            Error::IdentityNotFound(..) => {
                write!(f, "identity not found")
            }
            Error::EndpointMissingIpv4(..) => {
                write!(f, "endpoint has no IPv4 address")
            }
            Error::Netlink(..) => {
                write!(f, "netlink request failed")
            }
            Error::UnsupportedKernel(..) => {
                write!(
                    f,
                    "kernel does not support the egress gateway policy map"
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Netlink(error) => Some(error),
            _ => None,
        }
    }
}
