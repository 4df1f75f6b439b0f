//! Builders for synthetic frozen executables.
//!
//! Real inputs would need a whole Python toolchain, so the tests
//! assemble byte-exact archives in memory instead: payload heap,
//! TOC, cookie, with optional junk on either side.

#![allow(dead_code)] // not every test binary uses every helper

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;

pub const COOKIE_MAGIC: [u8; 8] = [b'M', b'E', b'I', 0x0c, 0x0b, 0x0a, 0x0b, 0x0e];

pub struct EntrySpec {
    pub name: String,
    pub type_code: u8,
    pub payload: Vec<u8>,
    pub compress: bool,
    /// Added to the declared uncompressed length to forge a corrupt record
    pub length_lie: i64,
}

impl EntrySpec {
    pub fn new(name: &str, type_code: u8, payload: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            type_code,
            payload: payload.to_vec(),
            compress: false,
            length_lie: 0,
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn with_length_lie(mut self, lie: i64) -> Self {
        self.length_lie = lie;
        self
    }
}

pub struct ArchiveSpec {
    pub entries: Vec<EntrySpec>,
    pub wide_cookie: bool,
    pub python_version: u32,
    pub prefix_junk: usize,
    pub appended_junk: usize,
}

impl ArchiveSpec {
    pub fn new(entries: Vec<EntrySpec>) -> Self {
        Self {
            entries,
            wide_cookie: true,
            python_version: 310,
            prefix_junk: 64,
            appended_junk: 0,
        }
    }

    pub fn narrow(mut self) -> Self {
        self.wide_cookie = false;
        self
    }

    pub fn python_version(mut self, raw: u32) -> Self {
        self.python_version = raw;
        self
    }

    pub fn prefix_junk(mut self, bytes: usize) -> Self {
        self.prefix_junk = bytes;
        self
    }

    pub fn appended_junk(mut self, bytes: usize) -> Self {
        self.appended_junk = bytes;
        self
    }

    /// Assembles the executable. Also returns the package length the
    /// cookie declares, so tests can check it round-trips.
    pub fn build(&self) -> (Vec<u8>, u64) {
        let mut heap = Vec::new();
        let mut toc = Vec::new();
        for entry in &self.entries {
            let stored = if entry.compress {
                deflate(&entry.payload)
            } else {
                entry.payload.clone()
            };
            let declared =
                (entry.payload.len() as i64 + entry.length_lie) as u32;

            let name_field_len = entry.name.len() + 1; // NUL terminator
            toc.extend_from_slice(&((18 + name_field_len) as u32).to_be_bytes());
            toc.extend_from_slice(&(heap.len() as u32).to_be_bytes());
            toc.extend_from_slice(&(stored.len() as u32).to_be_bytes());
            toc.extend_from_slice(&declared.to_be_bytes());
            toc.push(entry.compress as u8);
            toc.push(entry.type_code);
            toc.extend_from_slice(entry.name.as_bytes());
            toc.push(0);

            heap.extend_from_slice(&stored);
        }

        let cookie_size = if self.wide_cookie { 88 } else { 24 };
        let package_length = (heap.len() + toc.len() + cookie_size) as u64;

        let mut exe = vec![0xCC; self.prefix_junk];
        exe.extend_from_slice(&heap);
        let toc_offset = heap.len() as u32;
        exe.extend_from_slice(&toc);
        exe.extend_from_slice(&COOKIE_MAGIC);
        exe.extend_from_slice(&(package_length as u32).to_be_bytes());
        exe.extend_from_slice(&toc_offset.to_be_bytes());
        exe.extend_from_slice(&(toc.len() as u32).to_be_bytes());
        exe.extend_from_slice(&self.python_version.to_be_bytes());
        if self.wide_cookie {
            let mut lib = [0u8; 64];
            lib[..16].copy_from_slice(b"libpython3.10.so");
            exe.extend_from_slice(&lib);
        }
        exe.extend_from_slice(&vec![0xDD; self.appended_junk]);

        (exe, package_length)
    }

    /// Absolute offset of the first stored payload byte.
    pub fn heap_start(&self) -> usize {
        self.prefix_junk
    }
}

pub fn deflate(payload: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

// Minimal marshal encoding for PYZ indexes, mirroring what the build
// tool's `marshal.dump` emits for a list of name/record pairs.

fn m_str(s: &str) -> Vec<u8> {
    let mut out = vec![b'u'];
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

fn m_int(i: i32) -> Vec<u8> {
    let mut out = vec![b'i'];
    out.extend_from_slice(&i.to_le_bytes());
    out
}

fn m_pair(name: &str, record: [i32; 3]) -> Vec<u8> {
    let mut out = vec![b')', 2];
    out.extend_from_slice(&m_str(name));
    out.push(b')');
    out.push(3);
    for field in record {
        out.extend_from_slice(&m_int(field));
    }
    out
}

/// Builds a PYZ blob from `(dotted name, typecode, bytecode)` triples.
/// Typecode 1 marks a package.
pub fn build_pyz(modules: &[(&str, i32, &[u8])]) -> Vec<u8> {
    let mut heap = Vec::new();
    let mut index_items = Vec::new();
    for (name, typecode, payload) in modules {
        let compressed = deflate(payload);
        index_items.push(m_pair(
            name,
            [
                *typecode,
                (12 + heap.len()) as i32,
                compressed.len() as i32,
            ],
        ));
        heap.extend_from_slice(&compressed);
    }

    let mut blob = b"PYZ\0".to_vec();
    blob.extend_from_slice(b"U\r\r\n"); // embedded pyc magic
    blob.extend_from_slice(&((12 + heap.len()) as u32).to_be_bytes());
    blob.extend_from_slice(&heap);
    blob.push(b'[');
    blob.extend_from_slice(&(index_items.len() as u32).to_le_bytes());
    for item in &index_items {
        blob.extend_from_slice(item);
    }
    blob
}

/// Recursively collects `dir` into relative-path → contents,
/// for tree-to-tree comparisons.
pub fn collect_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, into: &mut BTreeMap<String, Vec<u8>>) {
        for dirent in std::fs::read_dir(dir).unwrap() {
            let path = dirent.unwrap().path();
            if path.is_dir() {
                walk(root, &path, into);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/");
                into.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut tree = BTreeMap::new();
    walk(dir, dir, &mut tree);
    tree
}
