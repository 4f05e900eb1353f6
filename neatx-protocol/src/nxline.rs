// Copyright 2024 Neatx Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The line-oriented NX client dialog: server prompts, command splitting,
//! the `--name="value"` parameter grammar, and the handful of scalar value
//! encodings (booleans, sizes, version strings) carried inside it.

use std::fmt;

pub const NX_PROMPT: &str = "NX>";
pub const NX_EOL: &str = "\n";

pub const NX_TRUE: &str = "1";
pub const NX_FALSE: &str = "0";

/// A fatal parameter-parsing failure; always reported on the wire as code
/// 597.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamParseError {
    pub input: String,
}

impl fmt::Display for ParamParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: Parsing parameters: string \"{}\" has invalid format", self.input)
    }
}

impl std::error::Error for ParamParseError {}

/// Renders a server prompt line: `NX> <code> <message>\n`, or a bare
/// `NX> <code> ` input prompt when `message` is `None`.
pub fn format_prompt(code: u16, message: Option<&str>) -> String {
    assert!(code <= 999, "status code out of range: {code}");

    let mut prompt = format!("{NX_PROMPT} {code} ");
    if let Some(message) = message {
        prompt.push_str(message);
        prompt.push_str(NX_EOL);
    }
    prompt
}

/// Splits a client line into its lower-cased command token and the
/// (untrimmed) remainder. The caller is expected to have already filtered
/// out blank lines.
pub fn split_command(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(idx) => (trimmed[..idx].to_lowercase(), trimmed[idx..].trim_start()),
        None => (trimmed.to_lowercase(), ""),
    }
}

/// Parses a `--name="value"` parameter string into an ordered list of
/// key/value pairs. Order and duplicates are preserved; callers that want
/// "last wins" semantics apply that on top.
pub fn parse_parameters(params: &str) -> Result<Vec<(String, String)>, ParamParseError> {
    let mut result = Vec::new();
    let mut work = params.trim();

    while !work.is_empty() {
        let (name, value, rest) = match match_one_parameter(work) {
            Some(m) => m,
            None => return Err(ParamParseError { input: params.to_string() }),
        };
        result.push((name, value));
        work = rest;
    }

    Ok(result)
}

/// Matches a single leading `WS* "--" NAME "=" '"' VALUE '"' WS*` token,
/// returning the parsed name, value, and the unconsumed remainder.
fn match_one_parameter(input: &str) -> Option<(String, String, &str)> {
    let rest = input.trim_start();
    let rest = rest.strip_prefix("--")?;

    let name_end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    if name_end == 0 || !rest.as_bytes()[0].is_ascii_alphabetic() {
        return None;
    }
    let name = &rest[..name_end];
    let rest = &rest[name_end..];

    let rest = rest.strip_prefix('=')?;
    let rest = rest.strip_prefix('"')?;

    let value_end = rest.find('"')?;
    let value = &rest[..value_end];
    let rest = rest[value_end + 1..].trim_start();

    Some((name.to_string(), value.to_string(), rest))
}

/// Serializes parsed parameters back to `--name="value"` form, space
/// separated. Round-trips through [`parse_parameters`] to the same pairs.
pub fn format_parameters(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(name, value)| format!("--{name}=\"{value}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Percent-decodes a parameter value (`unquote` in the spec's terminology).
pub fn unquote_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encodes a value's reserved characters (`quote` in the spec's
/// terminology). The reserved set is anything outside unreserved
/// URL-safe characters, matching the behavior `unquote_value` reverses.
pub fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

pub fn parse_nx_boolean(value: &str) -> bool {
    value == NX_TRUE
}

pub fn format_nx_boolean(value: bool) -> &'static str {
    if value {
        NX_TRUE
    } else {
        NX_FALSE
    }
}

/// Parses a size value such as `"64M"`, returning the count in mebibytes.
pub fn parse_nx_size(value: &str) -> Option<i64> {
    value.strip_suffix('M')?.parse().ok()
}

pub fn format_nx_size(value: i64) -> String {
    format!("{value}M")
}

/// Parses a dotted version string into its integer encoding, using
/// `digits` as the positional weight (not printed width) of each
/// component. `sep` names every character allowed to separate components,
/// so a build suffix joined by `-` can be tolerated by passing e.g. `".-"`
/// while `format_version` always re-joins with a single separator string.
pub fn parse_version(version: &str, sep: &str, digits: &[u32]) -> Result<u64, String> {
    let parts: Vec<&str> =
        version.split(|c: char| sep.contains(c)).take(digits.len()).collect();

    let mut total: u64 = 0;
    let mut total_exp: u32 = 0;
    for (idx, exp) in digits.iter().enumerate().rev() {
        let value: u64 = match parts.get(idx) {
            Some(part) => part
                .parse()
                .map_err(|_| format!("version part {idx} ({part:?}) is not numeric"))?,
            None => 0,
        };
        if value >= 10u64.pow(*exp) {
            return Err(format!("version part {idx} ({value}) too long for {exp} digits"));
        }
        total += value * 10u64.pow(total_exp);
        total_exp += exp;
    }

    Ok(total)
}

/// Inverse of [`parse_version`]; always joins with the literal `sep`
/// string (not a character class).
pub fn format_version(mut version: u64, sep: &str, digits: &[u32]) -> Result<String, String> {
    let mut parts = Vec::with_capacity(digits.len());
    for exp in digits.iter().rev() {
        let base = 10u64.pow(*exp);
        parts.push((version % base).to_string());
        version /= base;
    }

    if version > 0 {
        return Err(format!("version number too large for digits {digits:?}"));
    }

    parts.reverse();
    Ok(parts.join(sep))
}
