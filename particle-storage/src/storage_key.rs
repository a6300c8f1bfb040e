//! Storage key addresses and their string encoding.
//!
//! ```text
//!   volatile://{arc_id}/{unique}
//!   ramdisk://{unique}
//!   firebase://{project}.{domain}:{api_key}/{location}
//!   reference-mode://{backing}{container}      braces doubled inside
//!   create://{name}?Persistent,Queryable
//! ```
//!
//! `Display` and [`StorageKeyParser::parse`] round-trip exactly.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub const VOLATILE_PROTOCOL: &str = "volatile";
pub const RAMDISK_PROTOCOL: &str = "ramdisk";
pub const FIREBASE_PROTOCOL: &str = "firebase";
pub const REFERENCE_MODE_PROTOCOL: &str = "reference-mode";
pub const CREATE_PROTOCOL: &str = "create";

/// Where a replica's durable state lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageKey {
    Volatile { arc_id: String, unique: String },
    RamDisk { unique: String },
    Firebase(FirebaseStorageKey),
    ReferenceMode(Box<ReferenceModeStorageKey>),
    Creatable(CreatableStorageKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirebaseStorageKey {
    pub project_id: String,
    pub domain: String,
    pub api_key: String,
    pub location: String,
}

/// A container of references plus the backing address of the entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceModeStorageKey {
    pub backing_key: StorageKey,
    pub storage_key: StorageKey,
}

impl ReferenceModeStorageKey {
    pub fn new(backing_key: StorageKey, storage_key: StorageKey) -> Self {
        Self { backing_key, storage_key }
    }
}

impl From<ReferenceModeStorageKey> for StorageKey {
    fn from(key: ReferenceModeStorageKey) -> Self {
        StorageKey::ReferenceMode(Box::new(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    Persistent,
    Queryable,
    TiedToRuntime,
    TiedToArc,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Persistent => "Persistent",
            Capability::Queryable => "Queryable",
            Capability::TiedToRuntime => "TiedToRuntime",
            Capability::TiedToArc => "TiedToArc",
        }
    }
}

impl FromStr for Capability {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Persistent" => Ok(Capability::Persistent),
            "Queryable" => Ok(Capability::Queryable),
            "TiedToRuntime" => Ok(Capability::TiedToRuntime),
            "TiedToArc" => Ok(Capability::TiedToArc),
            other => Err(StorageError::UnknownCapability(other.to_string())),
        }
    }
}

/// Capabilities in the order they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capabilities(Vec<Capability>);

impl Capabilities {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_persistent(&self) -> bool {
        self.contains(Capability::Persistent)
    }

    pub fn is_queryable(&self) -> bool {
        self.contains(Capability::Queryable)
    }

    pub fn is_tied_to_runtime(&self) -> bool {
        self.contains(Capability::TiedToRuntime)
    }

    pub fn is_tied_to_arc(&self) -> bool {
        self.contains(Capability::TiedToArc)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A key that has not been materialized yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreatableStorageKey {
    pub name: String,
    pub capabilities: Capabilities,
}

impl CreatableStorageKey {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self { name: name.into(), capabilities }
    }

    pub fn from_string(key: &str) -> Result<Self, StorageError> {
        match StorageKeyParser::with_defaults().parse(key)? {
            StorageKey::Creatable(creatable) => Ok(creatable),
            _ => Err(StorageError::invalid_key(key, "not a create:// key")),
        }
    }
}

impl StorageKey {
    pub fn volatile(arc_id: impl Into<String>, unique: impl Into<String>) -> Self {
        StorageKey::Volatile { arc_id: arc_id.into(), unique: unique.into() }
    }

    pub fn ram_disk(unique: impl Into<String>) -> Self {
        StorageKey::RamDisk { unique: unique.into() }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            StorageKey::Volatile { .. } => VOLATILE_PROTOCOL,
            StorageKey::RamDisk { .. } => RAMDISK_PROTOCOL,
            StorageKey::Firebase(_) => FIREBASE_PROTOCOL,
            StorageKey::ReferenceMode(_) => REFERENCE_MODE_PROTOCOL,
            StorageKey::Creatable(_) => CREATE_PROTOCOL,
        }
    }

    /// Key of a child location, one per entity in a muxed backing store.
    pub fn child_key_with_component(&self, component: &str) -> StorageKey {
        match self {
            StorageKey::Volatile { arc_id, unique } => {
                StorageKey::Volatile { arc_id: arc_id.clone(), unique: format!("{unique}/{component}") }
            }
            StorageKey::RamDisk { unique } => StorageKey::RamDisk { unique: format!("{unique}/{component}") },
            StorageKey::Firebase(key) => StorageKey::Firebase(FirebaseStorageKey {
                location: format!("{}/{component}", key.location),
                ..key.clone()
            }),
            StorageKey::ReferenceMode(key) => ReferenceModeStorageKey::new(
                key.backing_key.clone(),
                key.storage_key.child_key_with_component(component),
            )
            .into(),
            StorageKey::Creatable(key) => StorageKey::Creatable(CreatableStorageKey {
                name: format!("{}/{component}", key.name),
                capabilities: key.capabilities.clone(),
            }),
        }
    }

    pub fn as_reference_mode(&self) -> Option<&ReferenceModeStorageKey> {
        match self {
            StorageKey::ReferenceMode(key) => Some(key),
            _ => None,
        }
    }
}

fn escape_braces(s: &str) -> String {
    s.replace('{', "{{").replace('}', "}}")
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Volatile { arc_id, unique } => write!(f, "{VOLATILE_PROTOCOL}://{arc_id}/{unique}"),
            StorageKey::RamDisk { unique } => write!(f, "{RAMDISK_PROTOCOL}://{unique}"),
            StorageKey::Firebase(key) => write!(
                f,
                "{FIREBASE_PROTOCOL}://{}.{}:{}/{}",
                key.project_id, key.domain, key.api_key, key.location
            ),
            StorageKey::ReferenceMode(key) => write!(
                f,
                "{REFERENCE_MODE_PROTOCOL}://{{{}}}{{{}}}",
                escape_braces(&key.backing_key.to_string()),
                escape_braces(&key.storage_key.to_string())
            ),
            StorageKey::Creatable(key) => {
                write!(f, "{CREATE_PROTOCOL}://{}", key.name)?;
                if !key.capabilities.is_empty() {
                    let caps: Vec<&str> = key.capabilities.0.iter().map(Capability::as_str).collect();
                    write!(f, "?{}", caps.join(","))?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for StorageKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageKeyParser::with_defaults().parse(s)
    }
}

/// Parses the address part (after `protocol://`) of one protocol.
pub type KeyParseFn = fn(address: &str, parser: &StorageKeyParser) -> Result<StorageKey, StorageError>;

/// Registry of key protocols. Constructed explicitly and passed around.
#[derive(Clone, Default)]
pub struct StorageKeyParser {
    parsers: HashMap<String, KeyParseFn>,
}

impl StorageKeyParser {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in protocol.
    pub fn with_defaults() -> Self {
        let mut parser = Self::new();
        parser.register(VOLATILE_PROTOCOL, parse_volatile);
        parser.register(RAMDISK_PROTOCOL, parse_ram_disk);
        parser.register(FIREBASE_PROTOCOL, parse_firebase);
        parser.register(REFERENCE_MODE_PROTOCOL, parse_reference_mode);
        parser.register(CREATE_PROTOCOL, parse_creatable);
        parser
    }

    pub fn register(&mut self, protocol: impl Into<String>, parse: KeyParseFn) {
        self.parsers.insert(protocol.into(), parse);
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut protocols: Vec<&str> = self.parsers.keys().map(String::as_str).collect();
        protocols.sort_unstable();
        protocols
    }

    pub fn parse(&self, key: &str) -> Result<StorageKey, StorageError> {
        let (protocol, address) = key
            .split_once("://")
            .ok_or_else(|| StorageError::invalid_key(key, "missing protocol"))?;
        let parse = self
            .parsers
            .get(protocol)
            .ok_or_else(|| StorageError::invalid_key(key, format!("unknown protocol {protocol}")))?;
        parse(address, self).map_err(|e| match e {
            StorageError::InvalidStorageKey { reason, .. } => StorageError::invalid_key(key, reason),
            other => other,
        })
    }
}

fn parse_volatile(address: &str, _: &StorageKeyParser) -> Result<StorageKey, StorageError> {
    let (arc_id, unique) = address
        .split_once('/')
        .ok_or_else(|| StorageError::invalid_key(address, "expected {arc_id}/{path}"))?;
    if arc_id.is_empty() {
        return Err(StorageError::invalid_key(address, "empty arc id"));
    }
    Ok(StorageKey::volatile(arc_id, unique))
}

fn parse_ram_disk(address: &str, _: &StorageKeyParser) -> Result<StorageKey, StorageError> {
    Ok(StorageKey::ram_disk(address))
}

fn parse_firebase(address: &str, _: &StorageKeyParser) -> Result<StorageKey, StorageError> {
    let malformed = || StorageError::invalid_key(address, "expected {project}.{domain}:{api_key}/{location}");
    let (host, location) = address.split_once('/').ok_or_else(malformed)?;
    let (project_and_domain, api_key) = host.split_once(':').ok_or_else(malformed)?;
    let (project_id, domain) = project_and_domain.split_once('.').ok_or_else(malformed)?;
    if project_id.is_empty() || domain.is_empty() || api_key.is_empty() {
        return Err(malformed());
    }
    Ok(StorageKey::Firebase(FirebaseStorageKey {
        project_id: project_id.to_string(),
        domain: domain.to_string(),
        api_key: api_key.to_string(),
        location: location.to_string(),
    }))
}

/// Reads one `{...}` group, undoubling braces. Returns the group and the rest.
fn take_braced(input: &str) -> Result<(String, &str), StorageError> {
    let mut chars = input.char_indices().peekable();
    match chars.next() {
        Some((_, '{')) => {}
        _ => return Err(StorageError::invalid_key(input, "expected '{'")),
    }
    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' => match chars.peek() {
                Some((_, '{')) => {
                    chars.next();
                    out.push('{');
                }
                _ => return Err(StorageError::invalid_key(input, "unescaped '{'")),
            },
            '}' => match chars.peek() {
                Some((_, '}')) => {
                    chars.next();
                    out.push('}');
                }
                _ => return Ok((out, &input[i + 1..])),
            },
            c => out.push(c),
        }
    }
    Err(StorageError::invalid_key(input, "unterminated '{'"))
}

fn parse_reference_mode(address: &str, parser: &StorageKeyParser) -> Result<StorageKey, StorageError> {
    let (backing, rest) = take_braced(address)?;
    let (container, rest) = take_braced(rest)?;
    if !rest.is_empty() {
        return Err(StorageError::invalid_key(address, "trailing characters"));
    }
    Ok(ReferenceModeStorageKey::new(parser.parse(&backing)?, parser.parse(&container)?).into())
}

fn parse_creatable(address: &str, _: &StorageKeyParser) -> Result<StorageKey, StorageError> {
    let (name, capabilities) = match address.split_once('?') {
        Some((name, caps)) => {
            if caps.is_empty() {
                return Err(StorageError::invalid_key(address, "empty capability list"));
            }
            let caps = caps.split(',').map(Capability::from_str).collect::<Result<Vec<_>, _>>()?;
            (name, Capabilities::new(caps))
        }
        None => (address, Capabilities::default()),
    };
    if name.is_empty() {
        return Err(StorageError::invalid_key(address, "empty name"));
    }
    Ok(StorageKey::Creatable(CreatableStorageKey::new(name, capabilities)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(key: &StorageKey) {
        let parsed: StorageKey = key.to_string().parse().unwrap();
        assert_eq!(&parsed, key, "round trip of {key}");
        assert_eq!(parsed.to_string(), key.to_string());
    }

    #[test]
    fn test_volatile_round_trip() {
        let key = StorageKey::volatile("!arc-id", "path/to/thing");
        assert_eq!(key.to_string(), "volatile://!arc-id/path/to/thing");
        round_trip(&key);
    }

    #[test]
    fn test_ram_disk_round_trip() {
        let key = StorageKey::ram_disk("path");
        assert_eq!(key.to_string(), "ramdisk://path");
        round_trip(&key);
    }

    #[test]
    fn test_firebase_round_trip() {
        let parsed: StorageKey = "firebase://project.domain.io:api-key/a/path".parse().unwrap();
        match &parsed {
            StorageKey::Firebase(key) => {
                assert_eq!(key.project_id, "project");
                assert_eq!(key.domain, "domain.io");
                assert_eq!(key.api_key, "api-key");
                assert_eq!(key.location, "a/path");
            }
            other => panic!("unexpected {other:?}"),
        }
        round_trip(&parsed);
    }

    #[test]
    fn test_reference_mode_round_trip() {
        let key: StorageKey = ReferenceModeStorageKey::new(
            StorageKey::volatile("!arc", "backing"),
            StorageKey::ram_disk("container"),
        )
        .into();
        assert_eq!(key.to_string(), "reference-mode://{volatile://!arc/backing}{ramdisk://container}");
        round_trip(&key);
    }

    #[test]
    fn test_nested_reference_mode_escapes_braces() {
        let inner: StorageKey = ReferenceModeStorageKey::new(
            StorageKey::ram_disk("a}b{"),
            StorageKey::ram_disk("}"),
        )
        .into();
        let outer: StorageKey = ReferenceModeStorageKey::new(inner, StorageKey::ram_disk("c")).into();
        round_trip(&outer);
    }

    #[test]
    fn test_creatable_round_trip() {
        let key = StorageKey::Creatable(CreatableStorageKey::new(
            "abc",
            Capabilities::new([Capability::TiedToArc, Capability::Persistent]),
        ));
        assert_eq!(key.to_string(), "create://abc?TiedToArc,Persistent");
        round_trip(&key);
        round_trip(&StorageKey::Creatable(CreatableStorageKey::new("plain", Capabilities::default())));
    }

    #[test]
    fn test_creatable_capability_flags() {
        let key = CreatableStorageKey::from_string("create://abc?TiedToRuntime").unwrap();
        assert_eq!(key.name, "abc");
        assert!(key.capabilities.is_tied_to_runtime());
        assert!(!key.capabilities.is_persistent());
        assert!(!key.capabilities.is_queryable());
        assert!(!key.capabilities.is_tied_to_arc());
    }

    #[test]
    fn test_unknown_capability() {
        let err = CreatableStorageKey::from_string("create://abc?Pertinent").unwrap_err();
        assert_eq!(err.to_string(), "Capability not recognized: Pertinent.");
    }

    #[test]
    fn test_unknown_protocol() {
        let err = "gopher://x".parse::<StorageKey>().unwrap_err();
        assert!(matches!(err, StorageError::InvalidStorageKey { .. }));
        assert!("no-protocol".parse::<StorageKey>().is_err());
    }

    #[test]
    fn test_malformed_keys() {
        assert!("volatile://no-slash".parse::<StorageKey>().is_err());
        assert!("firebase://nodomain/x".parse::<StorageKey>().is_err());
        assert!("reference-mode://{ramdisk://a}".parse::<StorageKey>().is_err());
        assert!("reference-mode://{ramdisk://a}{ramdisk://b}x".parse::<StorageKey>().is_err());
        assert!("create://abc?".parse::<StorageKey>().is_err());
    }

    #[test]
    fn test_custom_registry() {
        let mut parser = StorageKeyParser::new();
        parser.register(RAMDISK_PROTOCOL, parse_ram_disk);
        assert!(parser.parse("ramdisk://x").is_ok());
        assert!(parser.parse("volatile://a/b").is_err());
        assert_eq!(parser.protocols(), vec!["ramdisk"]);
    }

    #[test]
    fn test_child_key() {
        let key = StorageKey::volatile("!arc", "backing");
        assert_eq!(key.child_key_with_component("e1").to_string(), "volatile://!arc/backing/e1");
    }
}
