//! The drive-ignore list: drive letters the enumerator never queries.
//!
//! The list is a plain text file, one entry per line. Blank lines and lines
//! starting with `#` or `;` are skipped; any other line names a drive when
//! its first character is a letter.
//!
//! ```text
//! # system disk
//! C
//! ; docking station card reader
//! e:\
//! ```
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// File name looked up next to the executable.
pub const DEFAULT_FILE_NAME: &str = "ignored_drives.cfg";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IgnoreList {
    letters: BTreeSet<char>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let letters = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(['#', ';']))
            .filter_map(|line| line.chars().next().filter(char::is_ascii_alphabetic))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self { letters }
    }

    /// Reads the list from `path`. A missing file is an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let list = Self::parse(&text);
                debug!("loaded {} ignored drive(s) from {}", list.len(), path.display());
                Ok(list)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(source) => Err(Error::Handle {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn insert(&mut self, letter: char) {
        self.letters.insert(letter.to_ascii_uppercase());
    }

    pub fn contains(&self, letter: char) -> bool {
        self.letters.contains(&letter.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        self.letters.iter().copied()
    }
}
