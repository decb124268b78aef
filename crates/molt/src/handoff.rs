//! Handoff records carried across a process-replacing spawn.
//!
//! Everything the successor needs to know (which stage of the daemonize
//! sequence it is in, which descriptors it inherited and what they were
//! called) travels in environment variables. Any of those variables may
//! already exist in the user's environment, so every encoding chains the
//! previous value behind a `:` and the terminal stage puts it back.
//!
//! ## Wire format
//!
//! - `MOLT_STAGE`: `<stage>/<unix-nanos>/<sha1-hex>[:<previous value>]`
//! - `MOLT_RELOAD`: non-empty sentinel, present only in a reload successor
//! - `MOLT_LISTENERS`: decimal count of listening sockets that follow the
//!   inherited files
//! - `MOLT_FD_<n>`: `<hex file name>[:<previous value>]`, one per fd >= 3
//!
//! A missing `:` means nothing was carried, and restoring removes the
//! variable instead of setting it to an empty string.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

/// Stage marker variable.
pub const STAGE_VAR: &str = "MOLT_STAGE";
/// Present (non-empty) only in a process started by a reload.
pub const RELOAD_VAR: &str = "MOLT_RELOAD";
/// Number of listening sockets handed to a reload successor.
pub const LISTENERS_VAR: &str = "MOLT_LISTENERS";
/// Value written to [`RELOAD_VAR`].
pub const RELOAD_SENTINEL: &str = "reload";

const FD_VAR_PREFIX: &str = "MOLT_FD_";

/// First descriptor index available for inherited files and sockets.
pub const FIRST_EXTRA_FD: RawFd = 3;

/// Markers older than this are treated as foreign values.
pub const MARKER_TTL: Duration = Duration::from_secs(60);

/// Name of the variable describing inherited descriptor `index`.
pub fn fd_var(index: RawFd) -> String {
    format!("{FD_VAR_PREFIX}{index}")
}

/// Position within the self-replacement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProcessStage {
    /// The process the user started.
    #[default]
    Parent,
    /// First re-exec. Terminal when not daemonizing.
    FirstChild,
    /// Second re-exec, detached from the session. Terminal when daemonizing.
    Daemon,
}

impl ProcessStage {
    pub fn index(self) -> u8 {
        match self {
            ProcessStage::Parent => 0,
            ProcessStage::FirstChild => 1,
            ProcessStage::Daemon => 2,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ProcessStage::Parent),
            1 => Some(ProcessStage::FirstChild),
            2 => Some(ProcessStage::Daemon),
            _ => None,
        }
    }

    /// The stage a successor spawned from this one runs in.
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }
}

/// Decoded content of the stage marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRecord {
    pub stage: ProcessStage,
    /// The variable's value before the sequence started, if there was one.
    pub carried: Option<String>,
    /// Whether the signature matched. Untrusted records are always stage 0.
    pub trusted: bool,
}

impl HandoffRecord {
    /// Encode `stage`, chaining `carried` behind the signature.
    pub fn encode(stage: ProcessStage, carried: Option<&str>) -> String {
        Self::encode_at(stage, carried, SystemTime::now())
    }

    /// Decode a raw variable value. Never fails: anything that is not a
    /// fresh marker of ours decodes to stage 0 carrying the whole value.
    pub fn decode(raw: Option<&str>) -> Self {
        Self::decode_at(raw, SystemTime::now())
    }

    fn encode_at(stage: ProcessStage, carried: Option<&str>, now: SystemTime) -> String {
        let nanos = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let stage = stage.index().to_string();
        let nanos = nanos.to_string();
        let head = format!("{stage}/{nanos}/{}", sign(&stage, &nanos));
        match carried {
            Some(previous) => format!("{head}:{previous}"),
            None => head,
        }
    }

    fn decode_at(raw: Option<&str>, now: SystemTime) -> Self {
        let Some(raw) = raw else {
            return Self::foreign(None);
        };
        match parse_marker(raw, now) {
            Some((stage, carried)) => Self {
                stage,
                carried,
                trusted: true,
            },
            None => Self::foreign(Some(raw.to_owned())),
        }
    }

    fn foreign(carried: Option<String>) -> Self {
        Self {
            stage: ProcessStage::Parent,
            carried,
            trusted: false,
        }
    }
}

fn sign(stage: &str, nanos: &str) -> String {
    hex::encode(Sha1::digest(format!("{stage}/{nanos}").as_bytes()))
}

fn parse_marker(raw: &str, now: SystemTime) -> Option<(ProcessStage, Option<String>)> {
    let (head, carried) = split_chain(raw);
    let mut parts = head.splitn(3, '/');
    let stage = parts.next()?;
    let nanos = parts.next()?;
    let signature = parts.next()?;

    if sign(stage, nanos) != signature {
        return None;
    }

    let stage = ProcessStage::from_index(stage.parse().ok()?)?;
    let issued = UNIX_EPOCH + Duration::from_nanos(nanos.parse().ok()?);
    // Future timestamps fail here as well.
    let age = now.duration_since(issued).ok()?;
    if age > MARKER_TTL {
        return None;
    }

    Some((stage, carried.map(str::to_owned)))
}

fn split_chain(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (raw, None),
    }
}

/// Name of a file inherited at a fixed descriptor index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptorSlot {
    pub index: RawFd,
    pub name: PathBuf,
    /// Value of `MOLT_FD_<index>` before this slot was written.
    pub previous: Option<String>,
}

impl FileDescriptorSlot {
    pub fn encode(&self) -> String {
        let name = hex::encode(self.name.as_os_str().as_bytes());
        match &self.previous {
            Some(previous) => format!("{name}:{previous}"),
            None => name,
        }
    }

    /// Returns `None` when `raw` is not a slot encoding.
    pub fn decode(index: RawFd, raw: &str) -> Option<Self> {
        let (name, previous) = split_chain(raw);
        let name = hex::decode(name).ok()?;
        Some(Self {
            index,
            name: PathBuf::from(OsStr::from_bytes(&name)),
            previous: previous.map(str::to_owned),
        })
    }
}

/// Read the contiguous run of slots starting at [`FIRST_EXTRA_FD`].
pub fn read_slots(transport: &dyn HandoffTransport) -> Vec<FileDescriptorSlot> {
    let mut slots = Vec::new();
    let mut index = FIRST_EXTRA_FD;
    while let Some(slot) = transport
        .get(&fd_var(index))
        .and_then(|raw| FileDescriptorSlot::decode(index, &raw))
    {
        slots.push(slot);
        index += 1;
    }
    slots
}

/// Storage for handoff variables.
///
/// The process environment is the only transport that survives `exec`
/// without extra plumbing, but the stage machine only ever talks to this
/// trait.
pub trait HandoffTransport: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);

    /// Put back a value captured before the handoff overwrote it.
    fn restore(&self, key: &str, previous: Option<&str>) {
        match previous {
            Some(value) => self.set(key, value),
            None => self.remove(key),
        }
    }
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl HandoffTransport for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn remove(&self, key: &str) {
        std::env::remove_var(key);
    }
}

/// In-memory transport.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Mutex::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Environment a child would see: this one with `overrides` applied.
    pub fn derive(&self, overrides: &[(String, Option<String>)]) -> Self {
        let mut vars = self.snapshot();
        for (key, value) in overrides {
            match value {
                Some(value) => vars.insert(key.clone(), value.clone()),
                None => vars.remove(key),
            };
        }
        Self {
            vars: Mutex::new(vars),
        }
    }
}

impl HandoffTransport for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
