// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Native dataset properties and property-name classes.

use crate::types::{DatasetType, TypeMask};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const F: u32 = DatasetType::Filesystem.bit();
const S: u32 = DatasetType::Snapshot.bit();
const V: u32 = DatasetType::Volume.bit();
const B: u32 = DatasetType::Bookmark.bit();
const FV: u32 = F | V;
const FS: u32 = F | S;
const DS: u32 = F | S | V;
const ANY: u32 = F | S | V | B;

const RO: u8 = 1 << 0;
const INHERIT: u8 = 1 << 1;
const NUM: u8 = 1 << 2;
const HIDDEN: u8 = 1 << 3;

/// Static description of one native property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropInfo {
    pub name: &'static str,
    /// Dataset kinds the property applies to
    pub applies: TypeMask,
    pub readonly: bool,
    pub inheritable: bool,
    pub numeric: bool,
    /// Not shown by `zfs get all`
    pub hidden: bool,
    pub default: Option<&'static str>,
}

macro_rules! native_props {
    ($($variant:ident => $name:literal, $applies:expr, $attrs:expr, $default:expr;)*) => {
        /// Native dataset properties, in engine order.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ZfsProp {
            $($variant,)*
        }

        impl ZfsProp {
            pub const ALL: &'static [ZfsProp] = &[$(ZfsProp::$variant,)*];

            pub fn info(self) -> PropInfo {
                match self {
                    $(ZfsProp::$variant => PropInfo {
                        name: $name,
                        applies: TypeMask::from_bits($applies),
                        readonly: $attrs & RO != 0,
                        inheritable: $attrs & INHERIT != 0,
                        numeric: $attrs & NUM != 0,
                        hidden: $attrs & HIDDEN != 0,
                        default: $default,
                    },)*
                }
            }

            pub fn from_name(name: &str) -> Option<ZfsProp> {
                match name {
                    $($name => Some(ZfsProp::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

native_props! {
    Type => "type", ANY, RO, None;
    Creation => "creation", ANY, RO | NUM, None;
    Used => "used", DS, RO | NUM, None;
    Available => "available", FV, RO | NUM, None;
    Referenced => "referenced", DS, RO | NUM, None;
    CompressRatio => "compressratio", DS, RO | NUM, None;
    Mounted => "mounted", F, RO, None;
    Origin => "origin", FV, RO, None;
    Quota => "quota", F, NUM, Some("none");
    Reservation => "reservation", FV, NUM, Some("none");
    Volsize => "volsize", V, NUM, None;
    Volblocksize => "volblocksize", V, NUM, Some("8192");
    Recordsize => "recordsize", F, NUM | INHERIT, Some("131072");
    Mountpoint => "mountpoint", F, INHERIT, None;
    Sharenfs => "sharenfs", F, INHERIT, Some("off");
    Checksum => "checksum", FV, INHERIT, Some("on");
    Compression => "compression", FV, INHERIT, Some("off");
    Atime => "atime", F, INHERIT, Some("on");
    Devices => "devices", FS, INHERIT, Some("on");
    Exec => "exec", FS, INHERIT, Some("on");
    Setuid => "setuid", FS, INHERIT, Some("on");
    Readonly => "readonly", FV, INHERIT, Some("off");
    Zoned => "zoned", F, INHERIT, Some("off");
    Snapdir => "snapdir", F, INHERIT, Some("hidden");
    Private => "private", F, HIDDEN, None;
    AclInherit => "aclinherit", F, INHERIT, Some("restricted");
    CreateTxg => "createtxg", ANY, RO | NUM | HIDDEN, None;
    Name => "name", ANY, RO | HIDDEN, None;
    Canmount => "canmount", F, 0, Some("on");
    IscsiOptions => "iscsioptions", V, INHERIT | HIDDEN, None;
    Xattr => "xattr", FS, INHERIT, Some("on");
    NumClones => "numclones", S, RO | NUM | HIDDEN, None;
    Copies => "copies", FV, INHERIT | NUM, Some("1");
    Version => "version", FS, NUM, Some("5");
    Utf8Only => "utf8only", FS, 0, Some("off");
    Normalize => "normalization", FS, 0, Some("none");
    Case => "casesensitivity", FS, 0, Some("sensitive");
    Vscan => "vscan", F, INHERIT, Some("off");
    Nbmand => "nbmand", FS, INHERIT, Some("off");
    Sharesmb => "sharesmb", F, INHERIT, Some("off");
    Refquota => "refquota", F, NUM, Some("none");
    Refreservation => "refreservation", FV, NUM, Some("none");
    Guid => "guid", ANY, RO | NUM, None;
    PrimaryCache => "primarycache", DS, INHERIT, Some("all");
    SecondaryCache => "secondarycache", DS, INHERIT, Some("all");
    UsedSnap => "usedbysnapshots", FV, RO | NUM, None;
    UsedDs => "usedbydataset", FV, RO | NUM, None;
    UsedChild => "usedbychildren", FV, RO | NUM, None;
    UsedRefreserv => "usedbyrefreservation", FV, RO | NUM, None;
    UserAccounting => "useraccounting", DS, RO | HIDDEN, None;
    StmfShareinfo => "stmf_sbd_lu", V, HIDDEN, None;
    DeferDestroy => "defer_destroy", S, RO, None;
    UserRefs => "userrefs", S, RO | NUM, None;
    Logbias => "logbias", FV, INHERIT, Some("latency");
    Unique => "unique", DS, RO | NUM | HIDDEN, None;
    ObjsetId => "objsetid", DS, RO | NUM | HIDDEN, None;
    Dedup => "dedup", FV, INHERIT, Some("off");
    Mlslabel => "mlslabel", DS, INHERIT, Some("none");
    Sync => "sync", FV, INHERIT, Some("standard");
    DnodeSize => "dnodesize", F, INHERIT, Some("legacy");
    RefRatio => "refcompressratio", DS, RO | NUM, None;
    Written => "written", DS, RO | NUM, None;
    Clones => "clones", S, RO, None;
    LogicalUsed => "logicalused", FV, RO | NUM, None;
    LogicalReferenced => "logicalreferenced", DS, RO | NUM, None;
    Inconsistent => "inconsistent", FV, RO | HIDDEN, None;
    Volmode => "volmode", V, INHERIT, Some("default");
    FilesystemLimit => "filesystem_limit", F, NUM, Some("none");
    SnapshotLimit => "snapshot_limit", FV, NUM, Some("none");
    FilesystemCount => "filesystem_count", F, NUM, Some("none");
    SnapshotCount => "snapshot_count", FV, NUM, Some("none");
    Snapdev => "snapdev", V, INHERIT, Some("hidden");
    Acltype => "acltype", FS, INHERIT, Some("off");
    SelinuxContext => "context", DS, 0, Some("none");
    SelinuxFsContext => "fscontext", DS, 0, Some("none");
    SelinuxDefContext => "defcontext", DS, 0, Some("none");
    SelinuxRootContext => "rootcontext", DS, 0, Some("none");
    Relatime => "relatime", F, INHERIT, Some("off");
    RedundantMetadata => "redundant_metadata", FV, INHERIT, Some("all");
    Overlay => "overlay", F, INHERIT, Some("off");
    PrevSnap => "prevsnap", FV, RO | HIDDEN, None;
    ReceiveResumeToken => "receive_resume_token", FV, RO, None;
    Encryption => "encryption", ANY, RO, Some("off");
    KeyLocation => "keylocation", FV, 0, Some("none");
    KeyFormat => "keyformat", FV, 0, Some("none");
    Pbkdf2Salt => "pbkdf2salt", FV, NUM | HIDDEN, None;
    Pbkdf2Iters => "pbkdf2iters", FV, NUM, Some("0");
    EncryptionRoot => "encryptionroot", DS, RO, None;
    KeyGuid => "keyguid", DS, RO | NUM | HIDDEN, None;
    KeyStatus => "keystatus", DS, RO, None;
    RemapTxg => "remaptxg", FV, RO | NUM | HIDDEN, None;
}

impl ZfsProp {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn applies_to(self, kind: DatasetType) -> bool {
        // pool roots are filesystems
        let kind = if kind == DatasetType::Pool {
            DatasetType::Filesystem
        } else {
            kind
        };
        self.info().applies.contains(kind)
    }
}

impl fmt::Display for ZfsProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ZfsProp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ZfsProp::from_name(s).ok_or_else(|| format!("property \"{}\" does not exist", s))
    }
}

impl Serialize for ZfsProp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ZfsProp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

const USERQUOTA_PREFIXES: &[&str] = &[
    "userused@",
    "userquota@",
    "groupused@",
    "groupquota@",
    "userobjused@",
    "userobjquota@",
    "groupobjused@",
    "groupobjquota@",
    "projectused@",
    "projectquota@",
    "projectobjused@",
    "projectobjquota@",
];

/// Free-form `module:name` user property.
pub fn is_user_property(name: &str) -> bool {
    name.contains(':')
}

/// `userquota@alice`, `groupused@staff` and friends.
pub fn is_userquota_property(name: &str) -> bool {
    USERQUOTA_PREFIXES
        .iter()
        .any(|prefix| name.len() > prefix.len() && name.starts_with(prefix))
}

/// Whether a userquota-class property carries a limit, as opposed to usage.
pub fn is_quota_limit(name: &str) -> bool {
    is_userquota_property(name) && name.split('@').next().is_some_and(|p| p.ends_with("quota"))
}

/// `written@<snapshot>`.
pub fn is_written_property(name: &str) -> bool {
    name.len() > "written@".len() && name.starts_with("written@")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for prop in ZfsProp::ALL {
            assert_eq!(ZfsProp::from_name(prop.name()), Some(*prop));
        }
        assert_eq!(ZfsProp::from_name("compressratio"), Some(ZfsProp::CompressRatio));
        assert_eq!(ZfsProp::from_name("bogus"), None);
    }

    #[test]
    fn engine_order_is_preserved() {
        assert_eq!(ZfsProp::ALL[0], ZfsProp::Type);
        assert_eq!(ZfsProp::ALL[2], ZfsProp::Used);
        assert_eq!(ZfsProp::ALL.last(), Some(&ZfsProp::RemapTxg));
        assert_eq!(ZfsProp::Written as usize, 61);
    }

    #[test]
    fn applicability() {
        assert!(ZfsProp::Volsize.applies_to(DatasetType::Volume));
        assert!(!ZfsProp::Volsize.applies_to(DatasetType::Filesystem));
        assert!(ZfsProp::Mountpoint.applies_to(DatasetType::Pool));
        assert!(ZfsProp::Clones.applies_to(DatasetType::Snapshot));
        assert!(ZfsProp::Guid.applies_to(DatasetType::Bookmark));
        assert!(!ZfsProp::Used.applies_to(DatasetType::Bookmark));
    }

    #[test]
    fn name_classes() {
        assert!(is_user_property("com.example:owner"));
        assert!(!is_user_property("compression"));
        assert!(is_userquota_property("userquota@alice"));
        assert!(is_userquota_property("groupobjused@staff"));
        assert!(!is_userquota_property("userquota@"));
        assert!(is_quota_limit("userquota@alice"));
        assert!(!is_quota_limit("userused@alice"));
        assert!(is_written_property("written@monday"));
        assert!(!is_written_property("written"));
    }
}
