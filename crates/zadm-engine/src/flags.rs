// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Toggles for a send. Zeroed by default; filled in by the caller and read
/// only by the send driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SendFlags {
    pub verbose: bool,
    /// Send the whole dataset tree with properties and snapshots
    pub replicate: bool,
    /// Include all intermediate snapshots
    pub do_all: bool,
    /// Incremental base is the dataset's origin
    pub from_origin: bool,
    pub dedup: bool,
    pub props: bool,
    pub dry_run: bool,
    pub parsable: bool,
    pub progress: bool,
    pub large_block: bool,
    pub embed_data: bool,
    pub compress: bool,
    /// Send encrypted blocks as stored
    pub raw: bool,
}

impl SendFlags {
    /// Translate into the bitmask taken by the oldest engine generation.
    /// Only large-block, embedded-data and compressed survive.
    pub fn to_legacy_mask(&self) -> LzcSendFlags {
        let mut mask = LzcSendFlags::EMPTY;
        if self.large_block {
            mask = mask | LzcSendFlags::LARGE_BLOCK;
        }
        if self.embed_data {
            mask = mask | LzcSendFlags::EMBED_DATA;
        }
        if self.compress {
            mask = mask | LzcSendFlags::COMPRESS;
        }
        mask
    }
}

/// Toggles for a receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RecvFlags {
    pub verbose: bool,
    /// Use all but the first element of the sent name
    pub is_prefix: bool,
    /// Use only the last element of the sent name
    pub is_tail: bool,
    pub dry_run: bool,
    /// Roll back or destroy to make the receive possible
    pub force: bool,
    pub canmount_off: bool,
    /// Keep partial state so the receive can be resumed
    pub resumable: bool,
    pub byteswap: bool,
    pub nomount: bool,
}

/// Send flag bitmask of the low-level send call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LzcSendFlags(u32);

impl LzcSendFlags {
    pub const EMPTY: LzcSendFlags = LzcSendFlags(0);
    pub const EMBED_DATA: LzcSendFlags = LzcSendFlags(1 << 0);
    pub const LARGE_BLOCK: LzcSendFlags = LzcSendFlags(1 << 1);
    pub const COMPRESS: LzcSendFlags = LzcSendFlags(1 << 2);
    pub const RAW: LzcSendFlags = LzcSendFlags(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> LzcSendFlags {
        LzcSendFlags(bits)
    }

    pub fn contains(self, other: LzcSendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LzcSendFlags {
    type Output = LzcSendFlags;

    fn bitor(self, rhs: LzcSendFlags) -> LzcSendFlags {
        LzcSendFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_only_sets_exactly_the_compress_bit() {
        let flags = SendFlags {
            compress: true,
            ..Default::default()
        };
        assert_eq!(flags.to_legacy_mask(), LzcSendFlags::COMPRESS);
        assert_eq!(flags.to_legacy_mask().bits(), 1 << 2);
    }

    #[test]
    fn legacy_mask_drops_unsupported_toggles() {
        let flags = SendFlags {
            raw: true,
            replicate: true,
            verbose: true,
            ..Default::default()
        };
        assert_eq!(flags.to_legacy_mask(), LzcSendFlags::EMPTY);

        let flags = SendFlags {
            large_block: true,
            embed_data: true,
            ..Default::default()
        };
        let mask = flags.to_legacy_mask();
        assert!(mask.contains(LzcSendFlags::LARGE_BLOCK));
        assert!(mask.contains(LzcSendFlags::EMBED_DATA));
        assert!(!mask.contains(LzcSendFlags::COMPRESS));
    }

    #[test]
    fn flags_deserialize_with_missing_fields() {
        let flags: SendFlags = serde_json::from_str(r#"{"compress": true}"#).unwrap();
        assert!(flags.compress);
        assert!(!flags.raw);

        let flags: RecvFlags = serde_json::from_str(r#"{"resumable": true, "force": true}"#).unwrap();
        assert!(flags.resumable && flags.force);
        assert!(!flags.nomount);
    }
}
