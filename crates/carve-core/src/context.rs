//! Read-only collaborators shared by every function of one program: the
//! load image, symbol scope, user-op classification, and analysis settings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ir::{Address, Function};
use crate::pipeline::AnalysisConfig;

/// Raw bytes of the program being analysed.
pub trait LoadImage: Send + Sync + fmt::Debug {
    /// Fill `buf` from `addr`. Returns false if any byte is unmapped.
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool;

    /// Read an unsigned integer of `size` bytes (at most 8).
    fn read_uint(&self, addr: u64, size: u32, big_endian: bool) -> Option<u64> {
        let size = size.min(8) as usize;
        let mut buf = [0u8; 8];
        if !self.read(addr, &mut buf[..size]) {
            return None;
        }
        let bytes = &buf[..size];
        let value = if big_endian {
            bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
        } else {
            bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64)
        };
        Some(value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    pub base: u64,
    pub bytes: Vec<u8>,
}

/// In-memory load image made of disjoint segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryImage {
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.segments.push(Segment { base, bytes });
        self
    }

    /// Segment holding words of `size` bytes laid out in the given byte order.
    pub fn with_words(self, base: u64, size: u32, words: &[u64], big_endian: bool) -> Self {
        let mut bytes = Vec::with_capacity(words.len() * size as usize);
        for &w in words {
            let le = w.to_le_bytes();
            let chunk = &le[..size as usize];
            if big_endian {
                bytes.extend(chunk.iter().rev());
            } else {
                bytes.extend_from_slice(chunk);
            }
        }
        self.with_segment(base, bytes)
    }
}

impl LoadImage for MemoryImage {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        for seg in &self.segments {
            let Some(start) = addr.checked_sub(seg.base) else {
                continue;
            };
            let start = start as usize;
            let Some(end) = start.checked_add(buf.len()) else {
                continue;
            };
            if end <= seg.bytes.len() {
                buf.copy_from_slice(&seg.bytes[start..end]);
                return true;
            }
        }
        false
    }
}

/// Properties a new varnode inherits from the symbol covering its storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolProps {
    #[serde(default)]
    pub addr_tied: bool,
    #[serde(default)]
    pub persist: bool,
}

/// Storage-to-symbol lookups.
pub trait ScopeQuery: Send + Sync + fmt::Debug {
    fn query(&self, loc: Address, size: u32) -> Option<SymbolProps>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub loc: Address,
    pub size: u32,
    #[serde(flatten)]
    pub props: SymbolProps,
}

/// Flat list of symbols; the first entry overlapping the queried storage wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    #[serde(default)]
    pub symbols: Vec<SymbolEntry>,
}

impl ScopeQuery for SymbolTable {
    fn query(&self, loc: Address, size: u32) -> Option<SymbolProps> {
        self.symbols
            .iter()
            .find(|s| s.loc.overlaps(s.size, &loc, size))
            .map(|s| s.props)
    }
}

/// How a CALLOTHER index behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserOpKind {
    /// Externally implemented; its effects are unknown.
    #[default]
    Opaque,
    /// Expanded in place by an injection payload.
    Injected,
    /// Marks a jump-table computation helper.
    JumpAssist,
    /// Segmented address formation.
    Segment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserOpTable {
    #[serde(default)]
    ops: HashMap<u64, UserOpKind>,
}

impl UserOpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u64, kind: UserOpKind) {
        self.ops.insert(index, kind);
    }

    /// Unregistered indices are opaque.
    pub fn kind(&self, index: u64) -> UserOpKind {
        self.ops.get(&index).copied().unwrap_or_default()
    }
}

/// A storage location and its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    pub loc: Address,
    pub size: u32,
}

impl Storage {
    pub fn new(loc: Address, size: u32) -> Self {
        Self { loc, size }
    }
}

/// Program-wide context a function is analysed against.
#[derive(Debug, Clone)]
pub struct ProgramContext {
    pub image: Arc<dyn LoadImage>,
    pub scope: Option<Arc<dyn ScopeQuery>>,
    pub userops: UserOpTable,
    pub big_endian: bool,
    /// Where the return address lives on entry; a branch to it is a return.
    pub return_address: Option<Storage>,
    /// Stack pointer register.
    pub spacebase: Option<Storage>,
    pub config: AnalysisConfig,
}

impl Default for ProgramContext {
    fn default() -> Self {
        Self::new(Arc::new(MemoryImage::new()))
    }
}

impl ProgramContext {
    pub fn new(image: Arc<dyn LoadImage>) -> Self {
        Self {
            image,
            scope: None,
            userops: UserOpTable::new(),
            big_endian: false,
            return_address: None,
            spacebase: None,
            config: AnalysisConfig::default(),
        }
    }

    pub fn with_scope(mut self, scope: Arc<dyn ScopeQuery>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_userops(mut self, userops: UserOpTable) -> Self {
        self.userops = userops;
        self
    }

    pub fn with_big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    pub fn with_return_address(mut self, storage: Storage) -> Self {
        self.return_address = Some(storage);
        self
    }

    pub fn with_spacebase(mut self, storage: Storage) -> Self {
        self.spacebase = Some(storage);
        self
    }

    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn symbol_props(&self, loc: Address, size: u32) -> Option<SymbolProps> {
        self.scope.as_ref().and_then(|s| s.query(loc, size))
    }
}

/// Serialized function together with the program facts needed to analyse it.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub function: Function,
    #[serde(default)]
    pub image: MemoryImage,
    #[serde(default)]
    pub userops: UserOpTable,
    #[serde(default)]
    pub symbols: SymbolTable,
    #[serde(default)]
    pub big_endian: bool,
    #[serde(default)]
    pub return_address: Option<Storage>,
    #[serde(default)]
    pub spacebase: Option<Storage>,
}

impl AnalysisInput {
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let mut input: AnalysisInput = serde_json::from_str(json)?;
        input.function.rebuild_indices();
        Ok(input)
    }

    /// Attach a context built from the embedded program facts.
    pub fn into_function(self, config: AnalysisConfig) -> Function {
        let mut ctx = ProgramContext::new(Arc::new(self.image))
            .with_scope(Arc::new(self.symbols))
            .with_userops(self.userops)
            .with_big_endian(self.big_endian)
            .with_config(config);
        ctx.return_address = self.return_address;
        ctx.spacebase = self.spacebase;
        let mut func = self.function;
        func.set_context(Arc::new(ctx));
        func
    }
}
