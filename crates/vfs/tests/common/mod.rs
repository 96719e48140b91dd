//! Shared fixtures for VFS integration tests.

// Each test file compiles common/ separately, so not every helper is used
// from every binary.
#![allow(dead_code)]

pub mod store;

use std::io::Write;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One entry of a fixture archive.
pub struct Entry {
    pub name: &'static str,
    pub content: Vec<u8>,
    pub method: CompressionMethod,
    pub unix_mode: Option<u32>,
}

impl Entry {
    pub fn stored(name: &'static str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            content: content.into(),
            method: CompressionMethod::Stored,
            unix_mode: None,
        }
    }

    pub fn deflated(name: &'static str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            content: content.into(),
            method: CompressionMethod::Deflated,
            unix_mode: None,
        }
    }

    pub fn symlink(name: &'static str, target: &str) -> Self {
        Self {
            name,
            content: target.as_bytes().to_vec(),
            method: CompressionMethod::Stored,
            unix_mode: Some(0o120_777),
        }
    }
}

/// Build a ZIP archive in memory.
pub fn build_archive(entries: Vec<Entry>) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));

    for entry in entries {
        let mut options = SimpleFileOptions::default().compression_method(entry.method);
        // Symlink entries carry the POSIX LNK mode and their target as
        // content; the writer has a dedicated API for them.
        if matches!(entry.unix_mode, Some(mode) if mode & 0o170_000 == 0o120_000) {
            let target = String::from_utf8(entry.content).expect("symlink target");
            writer
                .add_symlink(entry.name, target, options)
                .expect("add_symlink");
            continue;
        }
        if let Some(mode) = entry.unix_mode {
            options = options.unix_permissions(mode);
        }
        writer.start_file(entry.name, options).expect("start_file");
        writer.write_all(&entry.content).expect("write entry");
    }

    writer
        .finish()
        .expect("finish archive")
        .into_inner()
}

/// The canonical little site used across tests: `public/` prefix with an
/// index page, a nested asset and a deflated file.
pub fn site_archive() -> Vec<u8> {
    build_archive(vec![
        Entry::stored("public/index.html", "hello\n"),
        Entry::stored("public/subdir/hello.html", "sub hello\n"),
        Entry::deflated("public/app.js", "console.log('hi');\n".repeat(64)),
        Entry::symlink("public/link.html", "index.html"),
        Entry::symlink("public/escape.html", "../outside.html"),
    ])
}
