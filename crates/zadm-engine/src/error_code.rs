// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Engine error codes and their text table.

use std::fmt;

/// Result of a call into the storage engine. The error is the engine's own
/// code, never reinterpreted.
pub type EngineResult<T> = Result<T, ErrorCode>;

macro_rules! error_codes {
    ($($variant:ident = $raw:expr => $text:expr,)*) => {
        /// Error codes reported by the storage engine.
        ///
        /// New codes appear across engine generations, so callers should go
        /// through [`ErrorCode::describe`] instead of matching exhaustively.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum ErrorCode {
            $($variant,)*
            /// A code this build has no name for
            Other(i32),
        }

        impl ErrorCode {
            pub fn from_raw(raw: i32) -> Self {
                match raw {
                    $($raw => ErrorCode::$variant,)*
                    other => ErrorCode::Other(other),
                }
            }

            pub fn raw(self) -> i32 {
                match self {
                    $(ErrorCode::$variant => $raw,)*
                    ErrorCode::Other(raw) => raw,
                }
            }

            /// Human-readable phrase for the code. Unmapped codes read
            /// "no error".
            pub fn describe(self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $text,)*
                    ErrorCode::Other(_) => "no error",
                }
            }
        }
    };
}

error_codes! {
    Success = 0 => "success",
    NoMem = 2000 => "out of memory",
    BadProp = 2001 => "invalid property value",
    PropReadonly = 2002 => "read-only property",
    PropType = 2003 => "property doesn't apply to datasets of this type",
    PropNonInherit = 2004 => "property cannot be inherited",
    PropSpace = 2005 => "invalid quota or reservation",
    BadType = 2006 => "operation not applicable to datasets of this type",
    Busy = 2007 => "pool or dataset is busy",
    Exists = 2008 => "pool or dataset exists",
    NoEnt = 2009 => "no such pool or dataset",
    BadStream = 2010 => "invalid backup stream",
    DsReadonly = 2011 => "dataset is read-only",
    VolTooBig = 2012 => "volume size exceeds limit for this system",
    InvalidName = 2013 => "invalid name",
    BadRestore = 2014 => "unable to restore to destination",
    BadBackup = 2015 => "backup failed",
    BadTarget = 2016 => "invalid target vdev",
    NoDevice = 2017 => "no such device in pool",
    BadDev = 2018 => "invalid device",
    NoReplicas = 2019 => "no valid replicas",
    Resilvering = 2020 => "currently resilvering",
    BadVersion = 2021 => "unsupported version or feature",
    PoolUnavail = 2022 => "pool is unavailable",
    DevOverflow = 2023 => "too many devices in one vdev",
    BadPath = 2024 => "must be an absolute path",
    CrossTarget = 2025 => "operation crosses datasets or pools",
    Zoned = 2026 => "dataset in use by local zone",
    MountFailed = 2027 => "mount failed",
    UmountFailed = 2028 => "umount failed",
    UnshareNfsFailed = 2029 => "unshare(1M) failed",
    ShareNfsFailed = 2030 => "share(1M) failed",
    Perm = 2031 => "permission denied",
    NoSpc = 2032 => "out of space",
    Fault = 2033 => "bad address",
    Io = 2034 => "I/O error",
    Intr = 2035 => "signal received",
    IsSpare = 2036 => "device is reserved as a hot spare",
    InvalConfig = 2037 => "invalid vdev configuration",
    Recursive = 2038 => "recursive dataset dependency",
    NoHistory = 2039 => "no history available",
    PoolProps = 2040 => "failed to retrieve pool properties",
    PoolNotSup = 2041 => "operation not supported on this type of pool",
    PoolInvalArg = 2042 => "invalid argument for this pool operation",
    NameTooLong = 2043 => "dataset name is too long",
    OpenFailed = 2044 => "open failed",
    NoCap = 2045 => "disk capacity information could not be retrieved",
    LabelFailed = 2046 => "write of label failed",
    BadWho = 2047 => "invalid user/group",
    BadPerm = 2048 => "invalid permission",
    BadPermSet = 2049 => "invalid permission set name",
    NoDelegation = 2050 => "delegated administration is disabled on pool",
    UnshareSmbFailed = 2051 => "smb remove share failed",
    ShareSmbFailed = 2052 => "smb add share failed",
    BadCache = 2053 => "invalid or missing cache file",
    IsL2Cache = 2054 => "device is in use as a cache",
    VdevNotSup = 2055 => "vdev specification is not supported",
    NotSup = 2056 => "operation not supported on this dataset",
    ActiveSpare = 2057 => "pool has active shared spare device",
    UnplayedLogs = 2058 => "log device has unplayed intent logs",
    ReftagRele = 2059 => "no such tag on this dataset",
    ReftagHold = 2060 => "tag already exists on this dataset",
    TagTooLong = 2061 => "tag too long",
    PipeFailed = 2062 => "pipe create failed",
    ThreadCreateFailed = 2063 => "thread create failed",
    PostsplitOnline = 2064 => "disk was split from this pool into a new one",
    Scrubbing = 2065 => "currently scrubbing; use 'zpool scrub -s' to cancel current scrub",
    NoScrub = 2066 => "there is no active scrub",
    Diff = 2067 => "unable to generate diffs",
    DiffData = 2068 => "invalid diff data",
    PoolReadonly = 2069 => "pool is read-only",
    ScrubPaused = 2070 => "scrub is paused; use 'zpool scrub' to resume",
    ActivePool = 2071 => "pool is imported on a different host",
    CryptoFailed = 2072 => "encryption failure",
    NoPending = 2073 => "operation is not in progress",
    CheckpointExists = 2074 => "checkpoint exists",
    DiscardingCheckpoint = 2075 => "currently discarding checkpoint",
    NoCheckpoint = 2076 => "checkpoint does not exist",
    DevrmInProgress = 2077 => "device removal in progress",
    VdevTooBig = 2078 => "device exceeds supported size",
    IocNotSupported = 2079 => "operation not supported by zfs kernel module",
    TooMany = 2080 => "argument list too long",
    Initializing = 2081 => "currently initializing",
    NoInitialize = 2082 => "there is no active initialization",
    WrongParent = 2083 => "invalid parent dataset",
    Trimming = 2084 => "currently trimming",
    NoTrim = 2085 => "there is no active trim",
    TrimNotSup = 2086 => "trim operations are not supported by this device",
    NoResilverDefer = 2087 => "operation not supported by zfs module",
    ExportInProgress = 2088 => "pool export in progress",
    Unknown = 2089 => "unknown error",
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_round_trip_through_names() {
        assert_eq!(ErrorCode::from_raw(2009), ErrorCode::NoEnt);
        assert_eq!(ErrorCode::NoEnt.raw(), 2009);
        assert_eq!(ErrorCode::from_raw(0), ErrorCode::Success);
        assert_eq!(ErrorCode::Unknown.raw(), 2089);
    }

    #[test]
    fn unmapped_codes_describe_as_no_error() {
        let code = ErrorCode::from_raw(4242);
        assert_eq!(code, ErrorCode::Other(4242));
        assert_eq!(code.raw(), 4242);
        assert_eq!(code.describe(), "no error");
    }

    #[test]
    fn known_codes_have_fixed_text() {
        assert_eq!(ErrorCode::NoEnt.to_string(), "no such pool or dataset");
        assert_eq!(ErrorCode::Unknown.describe(), "unknown error");
        assert_eq!(ErrorCode::Success.describe(), "success");
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::Busy.is_success());
    }
}
