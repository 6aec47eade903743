//! Path parsing: from a filesystem path to a normalized entity record.
//!
//! Two modes share one walk over the path's components. Strict mode admits
//! only tokens whose key is registered in the entity dictionary and checks
//! directory tokens against their filename counterparts; permissive mode
//! admits any `key-value` token and keeps unknown keys verbatim. Tokens that
//! survive neither interpretation are collected as parts, so permissive mode
//! can parse any path to something.

use std::collections::HashMap;

use crate::entity::{self, DICTIONARY};
use crate::error::{LayoutError, Result};

/// Which entity gate the parser applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Dictionary entities only; directory/filename mismatches are errors.
    Strict,
    /// Any `key-value` token is an entity; unknown keys keep their name.
    Permissive,
}

/// A parsed file: entities, datatype, suffix, extension and leftover parts.
///
/// Entity keys are canonical long names (or literal keys for permissive-mode
/// unknown entities), in insertion order: directory tokens outermost-first,
/// then filename tokens left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub path: String,
    pub dataset: u32,
    pub entities: Vec<(String, String)>,
    pub datatype: Option<String>,
    pub suffix: Option<String>,
    pub extension: Option<String>,
    pub parts: Vec<String>,
}

impl ParsedPath {
    fn empty(path: &str, dataset: u32) -> Self {
        Self {
            path: path.to_string(),
            dataset,
            entities: Vec::new(),
            datatype: None,
            suffix: None,
            extension: None,
            parts: Vec::new(),
        }
    }

    /// A record carrying no interpretation at all: every segment under the
    /// dataset root becomes a part. Used when a strict parse is demoted.
    pub fn parts_only(path: &str, dataset: u32, root_len: usize) -> Self {
        let mut parsed = Self::empty(path, dataset);
        parsed.parts = relative(path, root_len)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        parsed
    }

    /// Value of one entity by long or short name.
    pub fn entity(&self, key: &str) -> Option<&str> {
        let key = DICTIONARY.canonical(key).unwrap_or(key);
        match key {
            "datatype" => self.datatype.as_deref(),
            "suffix" => self.suffix.as_deref(),
            "extension" => self.extension.as_deref(),
            _ => self
                .entities
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
        }
    }

    /// All entities including datatype, suffix and extension.
    pub fn entity_map(&self) -> HashMap<&str, &str> {
        let mut map: HashMap<&str, &str> = self
            .entities
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let Some(datatype) = &self.datatype {
            map.insert("datatype", datatype);
        }
        if let Some(suffix) = &self.suffix {
            map.insert("suffix", suffix);
        }
        if let Some(extension) = &self.extension {
            map.insert("extension", extension);
        }
        map
    }
}

fn relative(path: &str, root_len: usize) -> &str {
    path[root_len.min(path.len())..].trim_start_matches('/')
}

/// Split a token at its first `-` into a key/value candidate.
fn split_token(token: &str) -> Option<(&str, &str)> {
    let i = token.find('-')?;
    Some((&token[..i], &token[i + 1..]))
}

struct Parser {
    mode: ParseMode,
    parsed: ParsedPath,
    directory_keys: Vec<String>,
}

impl Parser {
    /// Record an entity unless the key is already taken. Returns false when
    /// the token was rejected as a conflicting repeat, so the caller can
    /// keep the original token text as a part.
    fn push_entity(&mut self, key: &str, value: &str) -> Result<bool> {
        if let Some((_, existing)) = self.parsed.entities.iter().find(|(k, _)| k == key) {
            if existing == value {
                return Ok(true);
            }
            if self.mode == ParseMode::Strict && self.directory_keys.iter().any(|k| k == key) {
                return Err(LayoutError::InconsistentEntity {
                    entity: key.to_string(),
                    dir_value: existing.clone(),
                    file_value: value.to_string(),
                });
            }
            // Conflicting repeat within the filename: first occurrence wins.
            return Ok(false);
        }
        self.parsed
            .entities
            .push((key.to_string(), value.to_string()));
        Ok(true)
    }

    /// Directory component. `penultimate` marks the segment directly above
    /// the filename, where a datatype label is expected; `name_is_composite`
    /// reports whether the filename looks like an entity-bearing BIDS name.
    fn handle_directory(
        &mut self,
        segment: &str,
        penultimate: bool,
        name_is_composite: bool,
    ) -> Result<()> {
        if let Some((key, value)) = split_token(segment) {
            match self.mode {
                ParseMode::Strict => {
                    if let Some(long) = DICTIONARY.canonical(key) {
                        if DICTIONARY.permitted_in_directory(long) && !value.is_empty() {
                            if self.push_entity(long, value)? {
                                self.directory_keys.push(long.to_string());
                            } else {
                                self.parsed.parts.push(segment.to_string());
                            }
                            return Ok(());
                        }
                    }
                    self.parsed.parts.push(segment.to_string());
                    return Ok(());
                }
                ParseMode::Permissive => {
                    if !key.is_empty() && !value.is_empty() && !value.contains('_') {
                        let key = DICTIONARY
                            .canonical(key)
                            .map(str::to_string)
                            .unwrap_or_else(|| key.to_string());
                        if self.push_entity(&key, value)? {
                            self.directory_keys.push(key);
                        } else {
                            self.parsed.parts.push(segment.to_string());
                        }
                        return Ok(());
                    }
                }
            }
        }
        if penultimate && entity::is_datatype(segment) {
            self.parsed.datatype = Some(segment.to_string());
        } else if penultimate && self.mode == ParseMode::Permissive && name_is_composite {
            // A bare directory right above an entity-bearing filename acts
            // as an ad-hoc datatype in permissive mode.
            self.parsed.datatype = Some(segment.to_string());
        } else {
            self.parsed.parts.push(segment.to_string());
        }
        Ok(())
    }

    fn accept_filename_key(&self, key: &str) -> Option<String> {
        match self.mode {
            ParseMode::Strict => {
                let long = DICTIONARY.canonical(key)?;
                let rank = DICTIONARY.rank(long)?;
                DICTIONARY.defs()[rank].in_filename.then(|| long.to_string())
            }
            ParseMode::Permissive => {
                if key.is_empty() {
                    None
                } else {
                    Some(
                        DICTIONARY
                            .canonical(key)
                            .map(str::to_string)
                            .unwrap_or_else(|| key.to_string()),
                    )
                }
            }
        }
    }

    fn handle_keyval(&mut self, token: &str, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            if self.mode == ParseMode::Strict {
                return Err(LayoutError::InvalidEntityValue(token.to_string()));
            }
            self.parsed.parts.push(token.to_string());
        } else if let Some(key) = self.accept_filename_key(key) {
            if !self.push_entity(&key, value)? {
                self.parsed.parts.push(token.to_string());
            }
        } else {
            self.parsed.parts.push(token.to_string());
        }
        Ok(())
    }

    fn handle_filename(&mut self, name: &str) -> Result<()> {
        let tokens: Vec<&str> = name.split('_').collect();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            if i < last {
                match split_token(token) {
                    Some((key, value)) => self.handle_keyval(token, key, value)?,
                    None => self.parsed.parts.push(token.to_string()),
                }
                continue;
            }
            // Trailing token: the extension covers everything from its
            // first dot to the end of the string.
            let (stem, extension) = match token.find('.') {
                Some(dot) => (&token[..dot], Some(&token[dot..])),
                None => (*token, None),
            };
            self.parsed.extension = extension.map(str::to_string);
            match split_token(stem) {
                Some((key, value)) => self.handle_keyval(stem, key, value)?,
                None => {
                    if !stem.is_empty() {
                        self.parsed.suffix = Some(stem.to_string());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Heuristic for permissive-mode datatype promotion: does the filename look
/// like a composite BIDS name (entity tokens and/or a suffix)?
fn composite_name(name: &str) -> bool {
    name.contains('_')
        || split_token(name)
            .map(|(key, value)| !key.is_empty() && !value.is_empty())
            .unwrap_or(false)
}

/// Parse the portion of `path` below a dataset root (`root_len` bytes).
///
/// Strict-mode failures are returned as errors so the caller can demote the
/// file; permissive mode cannot fail.
pub fn parse(path: &str, dataset: u32, root_len: usize, mode: ParseMode) -> Result<ParsedPath> {
    let rel = relative(path, root_len);
    let mut parser = Parser {
        mode,
        parsed: ParsedPath::empty(path, dataset),
        directory_keys: Vec::new(),
    };
    let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Ok(parser.parsed);
    }
    let last = segments.len() - 1;
    let name_is_composite = composite_name(segments[last]);
    for (i, segment) in segments.iter().enumerate() {
        if i < last {
            parser.handle_directory(segment, i + 1 == last, name_is_composite)?;
        } else {
            parser.handle_filename(segment)?;
        }
    }
    Ok(parser.parsed)
}
