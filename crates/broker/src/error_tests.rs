// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn codes_are_stable() {
    assert_eq!(BrokerError::Authentication(String::new()).as_str(), "AUTHENTICATION_FAILURE");
    assert_eq!(BrokerError::Authorization(String::new()).as_str(), "AUTHORIZATION_FAILURE");
    assert_eq!(BrokerError::ClusterDisabled.as_str(), "CLUSTER_DISABLED");
    assert_eq!(BrokerError::RpcTimeout(String::new()).as_str(), "RPC_TIMEOUT");
}

#[test]
fn display_includes_detail() {
    let err = BrokerError::PeerNotFound("ws://peer-b:9900/stomp".to_owned());
    assert_eq!(err.to_string(), "PEER_NOT_FOUND: ws://peer-b:9900/stomp");
}

#[test]
fn cluster_disabled_has_fixed_detail() {
    assert_eq!(BrokerError::ClusterDisabled.detail(), "clustering is not enabled on this node");
}
