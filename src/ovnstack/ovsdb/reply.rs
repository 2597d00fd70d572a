/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


use super::driver::DriverError;
use std::iter::Peekable;
use std::str::Chars;

/// A driver reply decoded once into rows of unquoted values.
///
/// Each non-blank output line becomes one row. A line is either a
/// whitespace-separated list of atoms or a bracketed set `[a, b]`. Atoms may be
/// bare or wrapped in double or single quotes with backslash escapes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    rows: Vec<Vec<String>>,
}

impl Reply {
    pub fn decode(command: &str, lines: &[String]) -> Result<Self, DriverError> {
        let mut rows = Vec::new();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let row = decode_line(trimmed).map_err(|detail| DriverError::Malformed {
                command: command.to_string(),
                detail: format!("{detail} in line {trimmed:?}"),
            })?;
            if !row.is_empty() {
                rows.push(row);
            }
        }
        Ok(Reply { rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// First value of the first row; the usual shape of a `get` reply.
    pub fn first(&self) -> Option<&str> {
        self.rows
            .first()
            .and_then(|row| row.first())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// All values of all rows in order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .flat_map(|row| row.iter().map(String::as_str))
            .filter(|value| !value.is_empty())
    }
}

fn decode_line(line: &str) -> Result<Vec<String>, String> {
    if let Some(rest) = line.strip_prefix('[') {
        let inner = rest
            .strip_suffix(']')
            .ok_or_else(|| "unterminated set".to_string())?;
        return decode_set(inner);
    }
    if line.ends_with(']') && !line.contains('[') {
        return Err("unbalanced set bracket".to_string());
    }

    let mut chars = line.chars().peekable();
    let mut values = Vec::new();
    loop {
        skip_whitespace(&mut chars);
        if chars.peek().is_none() {
            break;
        }
        values.push(decode_atom(&mut chars, |c| c.is_whitespace())?);
    }
    Ok(values)
}

fn decode_set(inner: &str) -> Result<Vec<String>, String> {
    let mut chars = inner.chars().peekable();
    let mut values = Vec::new();
    loop {
        skip_whitespace(&mut chars);
        if chars.peek().is_none() {
            break;
        }
        let value = decode_atom(&mut chars, |c| c == ',' || c.is_whitespace())?;
        values.push(value);
        skip_whitespace(&mut chars);
        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(other) => return Err(format!("unexpected {other:?} between set elements")),
        }
    }
    Ok(values)
}

fn decode_atom(
    chars: &mut Peekable<Chars<'_>>,
    is_boundary: impl Fn(char) -> bool,
) -> Result<String, String> {
    match chars.peek().copied() {
        Some(quote @ ('"' | '\'')) => {
            chars.next();
            let value = decode_quoted(chars, quote)?;
            match chars.peek() {
                Some(&next) if !is_boundary(next) => {
                    Err(format!("unexpected {next:?} after quoted value"))
                }
                _ => Ok(value),
            }
        }
        _ => {
            let mut value = String::new();
            while let Some(&next) = chars.peek() {
                if is_boundary(next) {
                    break;
                }
                if next == '"' || next == '\'' {
                    return Err("stray quote inside bare value".to_string());
                }
                value.push(next);
                chars.next();
            }
            Ok(value)
        }
    }
}

fn decode_quoted(chars: &mut Peekable<Chars<'_>>, quote: char) -> Result<String, String> {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == quote {
            return Ok(value);
        }
        if c == '\\' {
            match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(escaped) => value.push(escaped),
                None => break,
            }
            continue;
        }
        value.push(c);
    }
    Err("unterminated quoted value".to_string())
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}
