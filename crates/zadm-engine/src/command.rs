// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Engine backed by the `zfs` command-line tool.
//!
//! Every engine call becomes one or more `zfs` invocations with scripted
//! (`-H`) output. Handles are names remembered by the engine; the tool is
//! stateless. Commands run through a [`CommandRunner`] so the argument
//! lists can be checked without a pool.

use crate::capability::EngineVersion;
use crate::engine::{Engine, Visitor};
use crate::error_code::{EngineResult, ErrorCode};
use crate::flags::{LzcSendFlags, RecvFlags, SendFlags};
use crate::prop::{is_user_property, ZfsProp};
use crate::property_set::PropertySet;
use crate::raw::{IoctlRequest, RawCommand};
use crate::types::{
    pool_of_name, DatasetType, MountFlags, NativeValue, PropSource, RawHandle, RawHold,
    RawPoolHandle, TypeMask, UnmountFlags, UserPropEntry, RECEIVED_SOURCE_MARKER,
};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

const SYSFS_VERSION: &str = "/sys/module/zfs/version";

/// Captured result of one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn from_output(output: Output) -> Self {
        CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// Runs external programs for [`CommandEngine`].
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
pub trait CommandRunner: Send {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Run with the child's standard output connected to `sink`.
    fn run_with_stdout(
        &self,
        program: &str,
        args: &[String],
        sink: OwnedFd,
    ) -> io::Result<CommandOutput>;

    /// Run with the child's standard input connected to `source`.
    fn run_with_stdin(
        &self,
        program: &str,
        args: &[String],
        source: OwnedFd,
    ) -> io::Result<CommandOutput>;
}

/// Runs commands on the host, elevating through `sudo -n` when asked to and
/// not already root.
#[derive(Clone, Debug, Default)]
pub struct SystemRunner {
    use_sudo: bool,
}

fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

impl SystemRunner {
    pub fn new(use_sudo: bool) -> Self {
        SystemRunner { use_sudo }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        debug!(operation = "run_command", program = %program, args = ?args, sudo = %self.use_sudo, "Running command");
        if self.use_sudo && !running_as_root() {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(program).args(args);
            command
        } else {
            let mut command = Command::new(program);
            command.args(args);
            command
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = self
            .command(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        Ok(CommandOutput::from_output(output))
    }

    fn run_with_stdout(
        &self,
        program: &str,
        args: &[String],
        sink: OwnedFd,
    ) -> io::Result<CommandOutput> {
        let output = self
            .command(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::piped())
            .output()?;
        Ok(CommandOutput::from_output(output))
    }

    fn run_with_stdin(
        &self,
        program: &str,
        args: &[String],
        source: OwnedFd,
    ) -> io::Result<CommandOutput> {
        let output = self
            .command(program, args)
            .stdin(Stdio::from(source))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        Ok(CommandOutput::from_output(output))
    }
}

/// Map a `zfs` error message onto the closest engine error code.
pub fn classify_stderr(stderr: &str) -> ErrorCode {
    let text = stderr.to_ascii_lowercase();
    let rules: &[(&[&str], ErrorCode)] = &[
        (&["permission denied", "password is required", "must be root"], ErrorCode::Perm),
        (&["no such tag"], ErrorCode::ReftagRele),
        (&["tag already exists"], ErrorCode::ReftagHold),
        (&["tag too long"], ErrorCode::TagTooLong),
        (&["does not exist", "no such pool", "no such dataset"], ErrorCode::NoEnt),
        (
            &["has children", "has dependent clones", "more recent snapshots", "already exists"],
            ErrorCode::Exists,
        ),
        (&["busy"], ErrorCode::Busy),
        (&["read-only property", "readonly property"], ErrorCode::PropReadonly),
        (&["does not apply"], ErrorCode::PropType),
        (&["invalid property", "bad numeric value", "bad property"], ErrorCode::BadProp),
        (&["invalid character", "invalid name", "empty component", "name is too long"], ErrorCode::InvalidName),
        (&["not a snapshot", "operation not applicable"], ErrorCode::BadType),
        (&["out of space"], ErrorCode::NoSpc),
        (&["invalid backup stream", "checksum mismatch", "incomplete stream", "bad magic"], ErrorCode::BadStream),
        (&["cannot mount"], ErrorCode::MountFailed),
        (&["cannot unmount"], ErrorCode::UmountFailed),
        (&["not supported"], ErrorCode::NotSup),
        (&["i/o error"], ErrorCode::Io),
    ];
    rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| text.contains(n)))
        .map_or(ErrorCode::Unknown, |(_, code)| *code)
}

fn parse_source(text: &str) -> PropSource {
    match text {
        "local" => PropSource::Local,
        "default" => PropSource::Default,
        "temporary" => PropSource::Temporary,
        "received" => PropSource::Received,
        other => other
            .strip_prefix("inherited from ")
            .map_or(PropSource::None, |from| PropSource::Inherited(from.to_string())),
    }
}

/// Send diagnostics go to fd 1, where the caller can capture them.
fn print_diagnostics(text: &str) {
    let mut out = io::stdout();
    if let Err(err) = writeln!(out, "{}", text.trim_end()).and_then(|_| out.flush()) {
        warn!(error = %err, "Failed to write send diagnostics");
    }
}

fn type_list(types: TypeMask) -> String {
    let names: Vec<&str> = types
        .iter()
        .map(|kind| match kind {
            DatasetType::Pool => DatasetType::Filesystem.as_str(),
            other => other.as_str(),
        })
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    names.join(",")
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// Engine driving the `zfs` tool.
pub struct CommandEngine<R: CommandRunner = SystemRunner> {
    runner: R,
    zfs: String,
    version: EngineVersion,
    handles: HashMap<u64, (String, DatasetType)>,
    pools: HashMap<u64, String>,
    next_id: u64,
    last_error: ErrorCode,
    last_error_description: String,
}

impl<R: CommandRunner> CommandEngine<R> {
    /// Build an engine, asking the tool which release is loaded.
    pub fn new(runner: R, zfs: impl Into<String>) -> EngineResult<Self> {
        let zfs = zfs.into();
        let version = Self::detect_version(&runner, &zfs)?;
        Ok(Self::with_version(runner, zfs, version))
    }

    pub fn with_version(runner: R, zfs: impl Into<String>, version: EngineVersion) -> Self {
        CommandEngine {
            runner,
            zfs: zfs.into(),
            version,
            handles: HashMap::new(),
            pools: HashMap::new(),
            next_id: 1,
            last_error: ErrorCode::Success,
            last_error_description: String::new(),
        }
    }

    fn detect_version(runner: &R, zfs: &str) -> EngineResult<EngineVersion> {
        if let Ok(output) = runner.run(zfs, &argv(&["version"])) {
            if output.success {
                // prefer the kernel module line
                let text = output
                    .stdout
                    .lines()
                    .find(|l| l.contains("kmod"))
                    .or_else(|| output.stdout.lines().next())
                    .unwrap_or_default();
                if let Ok(version) = EngineVersion::parse(text) {
                    return Ok(version);
                }
            }
        }
        match std::fs::read_to_string(SYSFS_VERSION) {
            Ok(text) => EngineVersion::parse(text.trim()).map_err(|e| {
                warn!(error = %e, "Unparseable engine version");
                ErrorCode::BadVersion
            }),
            Err(e) => {
                warn!(path = SYSFS_VERSION, error = %e, "Cannot determine engine version");
                Err(ErrorCode::BadVersion)
            }
        }
    }

    fn record(&mut self, code: ErrorCode, description: impl Into<String>) -> ErrorCode {
        self.last_error = code;
        self.last_error_description = description.into();
        code
    }

    fn check(&mut self, result: io::Result<CommandOutput>) -> EngineResult<CommandOutput> {
        match result {
            Ok(output) if output.success => Ok(output),
            Ok(output) => {
                let code = classify_stderr(&output.stderr);
                Err(self.record(code, output.stderr))
            }
            Err(e) => Err(self.record(ErrorCode::OpenFailed, format!("cannot run {}: {}", self.zfs, e))),
        }
    }

    fn zfs(&mut self, args: Vec<String>) -> EngineResult<CommandOutput> {
        let result = self.runner.run(&self.zfs, &args);
        self.check(result)
    }

    fn zfs_to(&mut self, args: Vec<String>, sink: BorrowedFd<'_>) -> EngineResult<CommandOutput> {
        let owned = match sink.try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => return Err(self.record(ErrorCode::PipeFailed, e.to_string())),
        };
        let result = self.runner.run_with_stdout(&self.zfs, &args, owned);
        self.check(result)
    }

    fn handle_entry(&mut self, handle: RawHandle) -> EngineResult<(String, DatasetType)> {
        match self.handles.get(&handle.id()) {
            Some(entry) => Ok(entry.clone()),
            None => Err(self.record(ErrorCode::BadType, format!("invalid handle {}", handle.id()))),
        }
    }

    fn handle_name(&mut self, handle: RawHandle) -> EngineResult<String> {
        self.handle_entry(handle).map(|(name, _)| name)
    }

    fn alloc(&mut self, name: &str, kind: DatasetType) -> RawHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, (name.to_string(), kind));
        RawHandle::new(id)
    }

    /// `zfs list -H -o name,type` over `args`, dropping `skip`.
    fn list(&mut self, args: &[&str], skip: Option<&str>) -> EngineResult<Vec<(String, DatasetType)>> {
        let mut full = argv(&["list", "-H", "-o", "name,type"]);
        full.extend(argv(args));
        let output = self.zfs(full)?;
        Ok(lines(&output.stdout)
            .filter_map(|line| line.split_once('\t'))
            .filter(|(name, _)| Some(*name) != skip)
            .map(|(name, kind)| (name.to_string(), DatasetType::from_name(kind)))
            .collect())
    }

    fn deliver(&mut self, entries: Vec<(String, DatasetType)>, visit: Visitor<'_>) -> EngineResult<()> {
        for (name, kind) in entries {
            let handle = self.alloc(&name, kind);
            if visit(handle).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn prop_args(props: &PropertySet, skip: &[&str]) -> Vec<String> {
        props
            .iter()
            .filter(|(name, _)| !skip.contains(name))
            .flat_map(|(name, value)| ["-o".to_string(), format!("{}={}", name, value)])
            .collect()
    }

    fn get_value(&mut self, name: &str, prop: &str, literal: bool) -> EngineResult<String> {
        let mut args = argv(&["get", "-H"]);
        if literal {
            args.push("-p".to_string());
        }
        args.extend(argv(&["-o", "value", prop, name]));
        Ok(self.zfs(args)?.stdout.trim().to_string())
    }

    fn send_args(flags: &SendFlags) -> Vec<String> {
        let mut args = argv(&["send"]);
        let switches = [
            (flags.large_block, "-L"),
            (flags.embed_data, "-e"),
            (flags.compress, "-c"),
            (flags.raw, "-w"),
            (flags.verbose, "-v"),
            (flags.dry_run, "-n"),
            (flags.parsable, "-P"),
            (flags.replicate, "-R"),
            (flags.props, "-p"),
            (flags.dedup, "-D"),
        ];
        args.extend(switches.iter().filter(|(on, _)| *on).map(|(_, s)| s.to_string()));
        args
    }

    fn run_send(
        &mut self,
        mut args: Vec<String>,
        name: String,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: &SendFlags,
    ) -> EngineResult<()> {
        if let Some(from) = from {
            args.push(if flags.do_all { "-I" } else { "-i" }.to_string());
            args.push(from.to_string());
        }
        args.push(name);
        let output = self.zfs_to(args, sink)?;
        if flags.verbose || flags.dry_run {
            print_diagnostics(&output.stderr);
        }
        Ok(())
    }

    fn estimate_named(&mut self, name: &str, from: Option<&str>, flags: &SendFlags) -> EngineResult<u64> {
        let mut args = Self::send_args(&SendFlags {
            verbose: false,
            dry_run: true,
            parsable: true,
            ..*flags
        });
        if let Some(from) = from {
            args.push("-i".to_string());
            args.push(from.to_string());
        }
        args.push(name.to_string());
        let output = self.zfs(args)?;
        let text = format!("{}\n{}", output.stdout, output.stderr);
        let size = text
            .lines()
            .filter_map(|l| l.strip_prefix("size"))
            .filter_map(|rest| rest.trim().parse::<u64>().ok())
            .last();
        match size {
            Some(size) => Ok(size),
            None => Err(self.record(ErrorCode::BadBackup, format!("no size estimate for '{}'", name))),
        }
    }
}

impl<R: CommandRunner> Engine for CommandEngine<R> {
    fn version(&self) -> EngineVersion {
        self.version
    }

    fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    fn last_error_description(&self) -> String {
        self.last_error_description.clone()
    }

    fn clear_last_error(&mut self) {
        self.last_error = ErrorCode::Success;
        self.last_error_description.clear();
    }

    fn open(&mut self, name: &str, types: TypeMask) -> EngineResult<RawHandle> {
        if name.is_empty() {
            return Err(self.record(ErrorCode::InvalidName, "cannot open '': empty name"));
        }
        let kinds = type_list(types);
        let found = self.list(&["-t", &kinds, name], None)?;
        match found.into_iter().find(|(n, _)| n == name) {
            Some((name, kind)) => Ok(self.alloc(&name, kind)),
            None => Err(self.record(
                ErrorCode::NoEnt,
                format!("cannot open '{}': dataset does not exist", name),
            )),
        }
    }

    fn close(&mut self, handle: RawHandle) {
        self.handles.remove(&handle.id());
    }

    fn name(&self, handle: RawHandle) -> EngineResult<String> {
        self.handles
            .get(&handle.id())
            .map(|(name, _)| name.clone())
            .ok_or(ErrorCode::BadType)
    }

    fn dataset_type(&self, handle: RawHandle) -> EngineResult<DatasetType> {
        self.handles
            .get(&handle.id())
            .map(|(_, kind)| *kind)
            .ok_or(ErrorCode::BadType)
    }

    fn exists(&mut self, name: &str, types: TypeMask) -> bool {
        let mut args = argv(&["list", "-H", "-o", "name", "-t"]);
        args.push(type_list(types));
        args.push(name.to_string());
        matches!(self.runner.run(&self.zfs, &args), Ok(output) if output.success)
    }

    fn iter_root(&mut self, visit: Visitor<'_>) -> EngineResult<()> {
        let roots = self.list(&["-d", "0", "-t", "filesystem"], None)?;
        self.deliver(roots, visit)
    }

    fn iter_children(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()> {
        let (name, kind) = self.handle_entry(parent)?;
        if !matches!(kind, DatasetType::Filesystem | DatasetType::Volume) {
            return Ok(());
        }
        let mut entries = self.list(&["-d", "1", "-t", "filesystem,volume", &name], Some(&name))?;
        entries.extend(self.list(&["-d", "1", "-t", "snapshot", "-s", "createtxg", &name], None)?);
        self.deliver(entries, visit)
    }

    fn iter_bookmarks(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()> {
        let name = self.handle_name(parent)?;
        let entries = self.list(&["-d", "1", "-t", "bookmark", "-s", "createtxg", &name], None)?;
        self.deliver(entries, visit)
    }

    fn iter_snapshots(&mut self, parent: RawHandle, visit: Visitor<'_>) -> EngineResult<()> {
        let name = self.handle_name(parent)?;
        let entries = self.list(&["-d", "1", "-t", "snapshot", "-s", "createtxg", &name], None)?;
        self.deliver(entries, visit)
    }

    fn iter_dependents(
        &mut self,
        handle: RawHandle,
        allow_recursion: bool,
        visit: Visitor<'_>,
    ) -> EngineResult<()> {
        let (name, kind) = self.handle_entry(handle)?;
        let mut entries = Vec::new();
        if kind == DatasetType::Snapshot {
            let clones = self.get_value(&name, "clones", false)?;
            for clone in clones.split(',').map(str::trim).filter(|c| !c.is_empty() && *c != "-") {
                if allow_recursion {
                    entries.extend(self.list(
                        &["-r", "-t", "filesystem,volume,snapshot", clone],
                        None,
                    )?);
                } else {
                    entries.push((clone.to_string(), DatasetType::Filesystem));
                }
            }
        } else {
            entries = self.list(&["-r", "-t", "filesystem,volume,snapshot", &name], Some(&name))?;
        }
        self.deliver(entries, visit)
    }

    fn create(&mut self, name: &str, kind: DatasetType, props: &PropertySet) -> EngineResult<()> {
        let mut args = argv(&["create"]);
        if kind == DatasetType::Volume {
            let Some(size) = props.get("volsize") else {
                return Err(self.record(ErrorCode::BadProp, "volume size must be specified"));
            };
            args.push("-V".to_string());
            args.push(size.to_string());
        }
        args.extend(Self::prop_args(props, &["volsize"]));
        args.push(name.to_string());
        self.zfs(args).map(drop)
    }

    fn destroy(&mut self, handle: RawHandle, defer: bool) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let mut args = argv(&["destroy"]);
        if defer {
            args.push("-d".to_string());
        }
        args.push(name);
        self.zfs(args).map(drop)
    }

    fn destroy_snaps(&mut self, snapshots: &[String], defer: bool) -> EngineResult<()> {
        let mut by_fs: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for snap in snapshots {
            if let Some((fs, short)) = snap.split_once('@') {
                by_fs.entry(fs).or_default().push(short);
            }
        }
        for (fs, shorts) in by_fs {
            let mut args = argv(&["destroy"]);
            if defer {
                args.push("-d".to_string());
            }
            args.push(format!("{}@{}", fs, shorts.join(",")));
            self.zfs(args)?;
        }
        Ok(())
    }

    fn clone_snapshot(
        &mut self,
        snapshot: RawHandle,
        target: &str,
        props: &PropertySet,
    ) -> EngineResult<()> {
        let name = self.handle_name(snapshot)?;
        let mut args = argv(&["clone"]);
        args.extend(Self::prop_args(props, &[]));
        args.push(name);
        args.push(target.to_string());
        self.zfs(args).map(drop)
    }

    fn snapshot(&mut self, name: &str, recursive: bool, props: &PropertySet) -> EngineResult<()> {
        let mut args = argv(&["snapshot"]);
        if recursive {
            args.push("-r".to_string());
        }
        args.extend(Self::prop_args(props, &[]));
        args.push(name.to_string());
        self.zfs(args).map(drop)
    }

    fn rollback(&mut self, _handle: RawHandle, snapshot: RawHandle, force: bool) -> EngineResult<()> {
        let snap = self.handle_name(snapshot)?;
        let mut args = argv(&["rollback"]);
        if force {
            args.push("-f".to_string());
        }
        args.push(snap);
        self.zfs(args).map(drop)
    }

    fn promote(&mut self, handle: RawHandle) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        self.zfs(vec!["promote".to_string(), name]).map(drop)
    }

    fn rename(
        &mut self,
        handle: RawHandle,
        new_name: &str,
        recursive: bool,
        force_unmount: bool,
    ) -> EngineResult<()> {
        let (name, kind) = self.handle_entry(handle)?;
        let mut args = argv(&["rename"]);
        if recursive {
            args.push("-r".to_string());
        }
        if force_unmount {
            args.push("-f".to_string());
        }
        args.push(name);
        args.push(new_name.to_string());
        self.zfs(args)?;
        self.handles.insert(handle.id(), (new_name.to_string(), kind));
        Ok(())
    }

    fn bookmark(&mut self, source: &str, bookmark: &str) -> EngineResult<()> {
        self.zfs(argv(&["bookmark", source, bookmark])).map(drop)
    }

    fn hold(&mut self, snapshot: RawHandle, tag: &str, recursive: bool) -> EngineResult<()> {
        let name = self.handle_name(snapshot)?;
        let mut args = argv(&["hold"]);
        if recursive {
            args.push("-r".to_string());
        }
        args.push(tag.to_string());
        args.push(name);
        self.zfs(args).map(drop)
    }

    fn release(&mut self, snapshot: RawHandle, tag: &str, recursive: bool) -> EngineResult<()> {
        let name = self.handle_name(snapshot)?;
        let mut args = argv(&["release"]);
        if recursive {
            args.push("-r".to_string());
        }
        args.push(tag.to_string());
        args.push(name);
        self.zfs(args).map(drop)
    }

    fn holds(&mut self, snapshot: RawHandle) -> EngineResult<Vec<RawHold>> {
        let name = self.handle_name(snapshot)?;
        let output = self.zfs(argv(&["holds", "-H", "-p", &name]))?;
        Ok(lines(&output.stdout)
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let _dataset = fields.next()?;
                let tag = fields.next()?;
                let created = fields.next().and_then(|t| t.trim().parse().ok()).unwrap_or(0);
                Some(RawHold {
                    tag: tag.to_string(),
                    created,
                })
            })
            .collect())
    }

    fn is_mounted(&mut self, handle: RawHandle) -> EngineResult<Option<String>> {
        let name = self.handle_name(handle)?;
        if self.get_value(&name, "mounted", false)? != "yes" {
            return Ok(None);
        }
        self.get_value(&name, "mountpoint", false).map(Some)
    }

    fn mount(&mut self, handle: RawHandle, options: Option<&str>, flags: MountFlags) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let mut args = argv(&["mount"]);
        if flags.overlay {
            args.push("-O".to_string());
        }
        if let Some(options) = options {
            args.push("-o".to_string());
            args.push(options.to_string());
        }
        args.push(name);
        self.zfs(args).map(drop)
    }

    fn unmount(&mut self, handle: RawHandle, flags: UnmountFlags) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let mut args = argv(&["unmount"]);
        if flags.force {
            args.push("-f".to_string());
        }
        args.push(name);
        self.zfs(args).map(drop)
    }

    fn unmount_all(&mut self, handle: RawHandle, flags: UnmountFlags) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let output = self.zfs(argv(&["list", "-H", "-o", "name,mounted", "-r", "-t", "filesystem", &name]))?;
        let mounted: Vec<String> = lines(&output.stdout)
            .filter_map(|line| line.split_once('\t'))
            .filter(|(_, mounted)| *mounted == "yes")
            .map(|(name, _)| name.to_string())
            .collect();
        // children before parents
        for fs in mounted.into_iter().rev() {
            let mut args = argv(&["unmount"]);
            if flags.force {
                args.push("-f".to_string());
            }
            args.push(fs);
            self.zfs(args)?;
        }
        Ok(())
    }

    fn pool_of(&mut self, handle: RawHandle) -> EngineResult<RawPoolHandle> {
        let name = self.handle_name(handle)?;
        let id = self.next_id;
        self.next_id += 1;
        self.pools.insert(id, pool_of_name(&name).to_string());
        Ok(RawPoolHandle::new(id))
    }

    fn pool_name(&self, pool: RawPoolHandle) -> EngineResult<String> {
        self.pools.get(&pool.id()).cloned().ok_or(ErrorCode::PoolUnavail)
    }

    fn close_pool(&mut self, pool: RawPoolHandle) {
        self.pools.remove(&pool.id());
    }

    fn prop_get(&mut self, handle: RawHandle, prop: ZfsProp, literal: bool) -> EngineResult<NativeValue> {
        let name = self.handle_name(handle)?;
        let mut args = argv(&["get", "-H"]);
        if literal {
            args.push("-p".to_string());
        }
        args.extend(argv(&["-o", "value,source", prop.name(), &name]));
        let output = self.zfs(args)?;
        let line = output.stdout.lines().next().unwrap_or_default();
        let (value, source) = line.split_once('\t').unwrap_or((line, "-"));
        Ok(NativeValue {
            value: value.to_string(),
            source: parse_source(source.trim()),
        })
    }

    fn prop_set(&mut self, handle: RawHandle, name: &str, value: &str) -> EngineResult<()> {
        let dataset = self.handle_name(handle)?;
        self.zfs(vec!["set".to_string(), format!("{}={}", name, value), dataset])
            .map(drop)
    }

    fn user_props(&mut self, handle: RawHandle) -> EngineResult<BTreeMap<String, UserPropEntry>> {
        let name = self.handle_name(handle)?;
        let output = self.zfs(argv(&["get", "-H", "-o", "property,value,source", "all", &name]))?;
        let mut props = BTreeMap::new();
        for line in lines(&output.stdout) {
            let mut fields = line.splitn(3, '\t');
            let (Some(prop), value, source) = (fields.next(), fields.next(), fields.next()) else {
                continue;
            };
            if !is_user_property(prop) {
                continue;
            }
            let source = source.map(|s| match parse_source(s) {
                PropSource::Local => name.clone(),
                PropSource::Received => RECEIVED_SOURCE_MARKER.to_string(),
                PropSource::Inherited(from) => from,
                _ => s.to_string(),
            });
            props.insert(
                prop.to_string(),
                UserPropEntry {
                    value: value.map(str::to_string),
                    source,
                },
            );
        }
        Ok(props)
    }

    fn userquota_get(&mut self, handle: RawHandle, name: &str, literal: bool) -> EngineResult<String> {
        let dataset = self.handle_name(handle)?;
        let value = self.get_value(&dataset, name, literal)?;
        if value == "-" || value == "none" {
            return Err(self.record(ErrorCode::NoEnt, format!("no value for '{}'", name)));
        }
        Ok(value)
    }

    fn written_get(&mut self, handle: RawHandle, name: &str, literal: bool) -> EngineResult<String> {
        let dataset = self.handle_name(handle)?;
        let value = self.get_value(&dataset, name, literal)?;
        if value == "-" {
            return Err(self.record(ErrorCode::NoEnt, format!("no value for '{}'", name)));
        }
        Ok(value)
    }

    fn send_legacy(
        &mut self,
        handle: RawHandle,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: LzcSendFlags,
    ) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let send_flags = SendFlags {
            large_block: flags.contains(LzcSendFlags::LARGE_BLOCK),
            embed_data: flags.contains(LzcSendFlags::EMBED_DATA),
            compress: flags.contains(LzcSendFlags::COMPRESS),
            raw: flags.contains(LzcSendFlags::RAW),
            ..SendFlags::default()
        };
        let args = Self::send_args(&send_flags);
        self.run_send(args, name, from, sink, &send_flags)
    }

    fn send_one(
        &mut self,
        handle: RawHandle,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: &SendFlags,
        redact_book: Option<&str>,
    ) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let mut args = Self::send_args(flags);
        if let Some(book) = redact_book {
            args.push("--redact".to_string());
            args.push(book.to_string());
        }
        self.run_send(args, name, from, sink, flags)
    }

    fn send_one_by_value(
        &mut self,
        handle: RawHandle,
        from: Option<&str>,
        sink: BorrowedFd<'_>,
        flags: SendFlags,
    ) -> EngineResult<()> {
        let name = self.handle_name(handle)?;
        let args = Self::send_args(&flags);
        self.run_send(args, name, from, sink, &flags)
    }

    fn send_resume(&mut self, flags: &SendFlags, sink: BorrowedFd<'_>, token: &str) -> EngineResult<()> {
        let mut args = Self::send_args(flags);
        args.push("-t".to_string());
        args.push(token.to_string());
        let output = self.zfs_to(args, sink)?;
        if flags.verbose || flags.dry_run {
            print_diagnostics(&output.stderr);
        }
        Ok(())
    }

    fn estimate_send(&mut self, handle: RawHandle, from: Option<&str>, flags: &SendFlags) -> EngineResult<u64> {
        let name = self.handle_name(handle)?;
        self.estimate_named(&name, from, flags)
    }

    fn ioctl(&mut self, request: IoctlRequest, cmd: &mut RawCommand) -> EngineResult<()> {
        let IoctlRequest::Send = request;
        let name = cmd.name.clone();
        let from = (!cmd.value.is_empty()).then(|| cmd.value.clone());
        let flags = SendFlags {
            from_origin: cmd.obj != 0,
            ..SendFlags::default()
        };
        cmd.objset_type = self.estimate_named(&name, from.as_deref(), &flags)?;
        Ok(())
    }

    fn receive(
        &mut self,
        target: &str,
        props: &PropertySet,
        flags: &RecvFlags,
        source: BorrowedFd<'_>,
    ) -> EngineResult<()> {
        let mut args = argv(&["receive"]);
        let switches = [
            (flags.verbose, "-v"),
            (flags.dry_run, "-n"),
            (flags.force, "-F"),
            (flags.nomount, "-u"),
            (flags.resumable, "-s"),
            (flags.is_prefix, "-d"),
            (flags.is_tail, "-e"),
        ];
        args.extend(switches.iter().filter(|(on, _)| *on).map(|(_, s)| s.to_string()));
        if flags.canmount_off {
            args.extend(argv(&["-o", "canmount=off"]));
        }
        args.extend(Self::prop_args(props, &[]));
        args.push(target.to_string());

        let owned = match source.try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => return Err(self.record(ErrorCode::PipeFailed, e.to_string())),
        };
        let result = self.runner.run_with_stdin(&self.zfs, &args, owned);
        self.check(result).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;
    use std::os::fd::AsFd;

    fn engine(runner: MockCommandRunner) -> CommandEngine<MockCommandRunner> {
        CommandEngine::with_version(runner, "zfs", EngineVersion::new(2, 1, 5))
    }

    fn args_are(expected: &'static [&'static str]) -> impl Fn(&str, &[String]) -> bool + Send + 'static {
        move |program, args| program == "zfs" && args.iter().map(String::as_str).eq(expected.iter().copied())
    }

    #[test]
    fn stderr_classification() {
        assert_eq!(
            classify_stderr("cannot open 'tank/x': dataset does not exist"),
            ErrorCode::NoEnt
        );
        assert_eq!(
            classify_stderr("cannot destroy 'tank/a': filesystem has children"),
            ErrorCode::Exists
        );
        assert_eq!(classify_stderr("sudo: a password is required"), ErrorCode::Perm);
        assert_eq!(classify_stderr("something odd"), ErrorCode::Unknown);
    }

    #[test]
    fn version_prefers_kernel_module_line() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["version"]))
            .returning(|_, _| Ok(CommandOutput::ok("zfs-2.1.5-1ubuntu6\nzfs-kmod-0.8.1-1\n")));
        let engine = CommandEngine::new(runner, "zfs").unwrap();
        assert_eq!(engine.version(), EngineVersion::new(0, 8, 1));
    }

    #[test]
    fn open_lists_with_type_filter() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["list", "-H", "-o", "name,type", "-t", "snapshot", "tank@a"]))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("tank@a\tsnapshot\n")));
        let mut engine = engine(runner);
        let handle = engine
            .open("tank@a", TypeMask::from(DatasetType::Snapshot))
            .unwrap();
        assert_eq!(engine.dataset_type(handle), Ok(DatasetType::Snapshot));
        assert_eq!(engine.name(handle).unwrap(), "tank@a");
    }

    #[test]
    fn failures_record_description() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Ok(CommandOutput::failed("cannot open 'tank/nope': dataset does not exist"))
        });
        let mut engine = engine(runner);
        assert_eq!(engine.open("tank/nope", TypeMask::ALL), Err(ErrorCode::NoEnt));
        assert_eq!(engine.last_error(), ErrorCode::NoEnt);
        assert!(engine.last_error_description().contains("tank/nope"));
    }

    #[test]
    fn children_are_filesystems_then_snapshots() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["list", "-H", "-o", "name,type", "-t", "filesystem", "tank"]))
            .returning(|_, _| Ok(CommandOutput::ok("tank\tfilesystem\n")));
        runner
            .expect_run()
            .withf(args_are(&["list", "-H", "-o", "name,type", "-d", "1", "-t", "filesystem,volume", "tank"]))
            .returning(|_, _| Ok(CommandOutput::ok("tank\tfilesystem\ntank/home\tfilesystem\n")));
        runner
            .expect_run()
            .withf(args_are(&[
                "list", "-H", "-o", "name,type", "-d", "1", "-t", "snapshot", "-s", "createtxg", "tank",
            ]))
            .returning(|_, _| Ok(CommandOutput::ok("tank@a\tsnapshot\n")));
        let mut engine = engine(runner);
        let root = engine.open("tank", TypeMask::from(DatasetType::Filesystem)).unwrap();
        let mut names = Vec::new();
        let mut handles = Vec::new();
        engine
            .iter_children(root, &mut |h: RawHandle| {
                handles.push(h);
                ControlFlow::Continue(())
            })
            .unwrap();
        for h in handles {
            names.push(engine.name(h).unwrap());
            engine.close(h);
        }
        assert_eq!(names, vec!["tank/home", "tank@a"]);
    }

    #[test]
    fn prop_get_parses_inherited_source() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["list", "-H", "-o", "name,type", "-t", "filesystem", "tank/home"]))
            .returning(|_, _| Ok(CommandOutput::ok("tank/home\tfilesystem\n")));
        runner
            .expect_run()
            .withf(args_are(&["get", "-H", "-o", "value,source", "compression", "tank/home"]))
            .returning(|_, _| Ok(CommandOutput::ok("lz4\tinherited from tank\n")));
        let mut engine = engine(runner);
        let h = engine.open("tank/home", TypeMask::from(DatasetType::Filesystem)).unwrap();
        let value = engine.prop_get(h, ZfsProp::Compression, false).unwrap();
        assert_eq!(value.value, "lz4");
        assert_eq!(value.source, PropSource::Inherited("tank".to_string()));
    }

    #[test]
    fn legacy_send_maps_mask_to_switches() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["list", "-H", "-o", "name,type", "-t", "snapshot", "tank@b"]))
            .returning(|_, _| Ok(CommandOutput::ok("tank@b\tsnapshot\n")));
        runner
            .expect_run_with_stdout()
            .withf(|program, args, _| {
                program == "zfs"
                    && args.iter().map(String::as_str).eq(["send", "-c", "-i", "tank@a", "tank@b"])
            })
            .times(1)
            .returning(|_, _, _| Ok(CommandOutput::ok("")));
        let mut engine = engine(runner);
        let h = engine.open("tank@b", TypeMask::from(DatasetType::Snapshot)).unwrap();
        let sink = tempfile::tempfile().unwrap();
        engine
            .send_legacy(h, Some("tank@a"), sink.as_fd(), LzcSendFlags::COMPRESS)
            .unwrap();
    }

    #[test]
    #[serial_test::serial(stdout)]
    fn verbose_send_prints_the_child_diagnostics() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["list", "-H", "-o", "name,type", "-t", "snapshot", "tank@b"]))
            .returning(|_, _| Ok(CommandOutput::ok("tank@b\tsnapshot\n")));
        runner
            .expect_run_with_stdout()
            .withf(|program, args, _| program == "zfs" && args.first().map(String::as_str) == Some("send"))
            .times(1)
            .returning(|_, _, _| {
                Ok(CommandOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: "full send of tank@b estimated size is 1.50K\n".to_string(),
                })
            });
        let mut engine = engine(runner);
        let h = engine.open("tank@b", TypeMask::from(DatasetType::Snapshot)).unwrap();
        let sink = tempfile::tempfile().unwrap();
        let flags = SendFlags {
            verbose: true,
            ..Default::default()
        };
        let (sent, text) =
            crate::capture_stdout(|| engine.send_one(h, None, sink.as_fd(), &flags, None)).unwrap();
        sent.unwrap();
        assert!(text.contains("full send of tank@b estimated size is 1.50K\n"));
    }

    #[test]
    fn estimate_parses_parsable_size_line() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(args_are(&["send", "-n", "-P", "-i", "tank@a", "tank@b"]))
            .returning(|_, _| Ok(CommandOutput::ok("incremental\ttank@a\ttank@b\t4096\nsize\t4096\n")));
        let mut engine = engine(runner);
        let mut cmd = RawCommand::new("tank@b");
        cmd.value = "tank@a".to_string();
        engine.ioctl(IoctlRequest::Send, &mut cmd).unwrap();
        assert_eq!(cmd.objset_type, 4096);
    }
}
