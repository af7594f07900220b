// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `IDENTIFY` response: what `nsqd` tells us back about the features it
//! actually granted (which may differ from what we asked for -- an old
//! `nsqd` ignores fields it doesn't recognize).

use serde::Deserialize;

/// Parsed `IDENTIFY` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiatedFeatures {
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub deflate_level: i32,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default = "default_max_rdy_count")]
    pub max_rdy_count: i64,
    #[serde(default)]
    pub max_msg_timeout: i64,
    #[serde(default)]
    pub msg_timeout: i64,
}

fn default_max_rdy_count() -> i64 {
    2500
}

impl NegotiatedFeatures {
    /// What a pre-feature-negotiation `nsqd` implies by answering IDENTIFY
    /// with a plain `OK`: no TLS, no compression, no auth, and the
    /// historical default `max_rdy_count`.
    pub fn legacy() -> Self {
        NegotiatedFeatures {
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 0,
            auth_required: false,
            max_rdy_count: default_max_rdy_count(),
            max_msg_timeout: 0,
            msg_timeout: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_response() {
        let body = br#"{"max_rdy_count": 2500, "tls_v1": false}"#;
        let negotiated: NegotiatedFeatures = serde_json::from_slice(body).unwrap();
        assert_eq!(negotiated.max_rdy_count, 2500);
        assert!(!negotiated.tls_v1);
    }

    #[test]
    fn defaults_missing_fields() {
        let body = br#"{}"#;
        let negotiated: NegotiatedFeatures = serde_json::from_slice(body).unwrap();
        assert_eq!(negotiated.max_rdy_count, 2500);
        assert!(!negotiated.auth_required);
    }

    #[test]
    fn legacy_disables_every_negotiable_feature() {
        let negotiated = NegotiatedFeatures::legacy();
        assert!(!negotiated.tls_v1 && !negotiated.snappy && !negotiated.deflate && !negotiated.auth_required);
        assert_eq!(negotiated.max_rdy_count, 2500);
    }
}
