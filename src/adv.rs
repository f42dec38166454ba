//! Advertising Data Parsing
//!
//! Legacy advertising payloads are a sequence of `[length, type, data...]`
//! structures. The gateway walks them to find the peer's local name before
//! creating an ACL connection.

use crate::constants::{AD_TYPE_NAME_COMPLETE, AD_TYPE_NAME_SHORTENED};

/// Legacy advertising PDU type as reported by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvertisingType {
    /// Connectable undirected advertising (`ADV_IND`)
    ConnectableUndirected,
    /// Connectable directed advertising (`ADV_DIRECT_IND`), carries no payload
    ConnectableDirected,
    /// Scannable undirected advertising (`ADV_SCAN_IND`)
    ScannableUndirected,
    /// Non-connectable undirected advertising (`ADV_NONCONN_IND`)
    NonConnectable,
    /// Extended advertising report
    Extended,
}

/// One AD structure borrowed from an advertising payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    /// AD type
    pub ad_type: u8,
    /// AD payload (without length and type)
    pub data: &'a [u8],
}

/// Iterator over the AD structures of an advertising payload
///
/// Iteration stops at the first zero-length structure (early termination) or
/// at the first structure that claims more bytes than remain (malformed).
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    remaining: &'a [u8],
    malformed: bool,
}

impl<'a> AdStructures<'a> {
    /// Create an iterator over `payload`
    #[must_use]
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            remaining: payload,
            malformed: false,
        }
    }

    /// Whether iteration stopped on a malformed structure
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = AdStructure<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.remaining.split_first()?;
        if len == 0 {
            self.remaining = &[];
            return None;
        }

        let len = usize::from(len);
        if len > rest.len() {
            self.malformed = true;
            self.remaining = &[];
            return None;
        }

        let (structure, rest) = rest.split_at(len);
        self.remaining = rest;
        Some(AdStructure {
            ad_type: structure[0],
            data: &structure[1..],
        })
    }
}

/// Find the local name (complete or shortened) in an advertising payload
#[must_use]
pub fn local_name(payload: &[u8]) -> Option<&[u8]> {
    AdStructures::new(payload)
        .find(|ad| ad.ad_type == AD_TYPE_NAME_COMPLETE || ad.ad_type == AD_TYPE_NAME_SHORTENED)
        .map(|ad| ad.data)
}

/// Check whether a connectable advertising report carries the expected peer name
#[must_use]
pub fn matches_peer_name(adv_type: AdvertisingType, payload: &[u8], peer_name: &str) -> bool {
    if adv_type != AdvertisingType::ConnectableUndirected {
        return false;
    }
    local_name(payload).is_some_and(|name| name == peer_name.as_bytes())
}
