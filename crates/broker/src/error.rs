// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Unified error type for broker, routing, and cluster operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The authenticate hook rejected the CONNECT frame.
    Authentication(String),
    /// The authorize hook denied a SEND or SUBSCRIBE.
    Authorization(String),
    /// The exchange configuration could not be built.
    InvalidConfiguration(String),
    /// A distribution exchange named a type other than `random`/`roundrobin`.
    UnknownDistributionType(String),
    /// An RPC was addressed to a peer with no live connection.
    PeerNotFound(String),
    /// An RPC deadline expired with no response.
    RpcTimeout(String),
    /// The remote peer executed the RPC but reported failure.
    RpcFailed(String),
    /// A cluster-only API was called with clustering disabled.
    ClusterDisabled,
}

impl BrokerError {
    /// Machine-readable error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AUTHENTICATION_FAILURE",
            Self::Authorization(_) => "AUTHORIZATION_FAILURE",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::UnknownDistributionType(_) => "UNKNOWN_DISTRIBUTION_TYPE",
            Self::PeerNotFound(_) => "PEER_NOT_FOUND",
            Self::RpcTimeout(_) => "RPC_TIMEOUT",
            Self::RpcFailed(_) => "RPC_FAILED",
            Self::ClusterDisabled => "CLUSTER_DISABLED",
        }
    }

    /// Human-readable detail, suitable for an ERROR frame body.
    pub fn detail(&self) -> &str {
        match self {
            Self::Authentication(d)
            | Self::Authorization(d)
            | Self::InvalidConfiguration(d)
            | Self::UnknownDistributionType(d)
            | Self::PeerNotFound(d)
            | Self::RpcTimeout(d)
            | Self::RpcFailed(d) => d,
            Self::ClusterDisabled => "clustering is not enabled on this node",
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterDisabled => f.write_str(self.as_str()),
            _ => write!(f, "{}: {}", self.as_str(), self.detail()),
        }
    }
}

impl std::error::Error for BrokerError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
