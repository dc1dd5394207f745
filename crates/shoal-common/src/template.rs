//! Brace-expansion object-name templates
//!
//! Grammar: literal text interleaved with `{start..end[..step]}` ranges,
//! e.g. `pre-{000..150..2}-suf`. The end is inclusive; a start token with
//! a leading zero fixes the zero-padded width.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Part {
    Text(String),
    Range {
        start: u64,
        end: u64,
        step: u64,
        width: usize,
    },
}

/// A parsed template; iterates the full cartesian expansion in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjTemplate {
    parts: Vec<Part>,
}

impl ObjTemplate {
    pub fn parse(s: &str) -> Result<Self> {
        let bad = |why: &str| Error::Fatal(format!("invalid template {s:?}: {why}"));
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = s;
        while let Some(open) = rest.find('{') {
            text.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .ok_or_else(|| bad("unbalanced brace"))?
                + open;
            if !text.is_empty() {
                parts.push(Part::Text(std::mem::take(&mut text)));
            }
            parts.push(Self::parse_range(&rest[open + 1..close]).map_err(|e| bad(&e))?);
            rest = &rest[close + 1..];
        }
        text.push_str(rest);
        if text.contains('}') {
            return Err(bad("unbalanced brace"));
        }
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }
        if !parts.iter().any(|p| matches!(p, Part::Range { .. })) {
            return Err(bad("no range"));
        }
        Ok(Self { parts })
    }

    fn parse_range(body: &str) -> std::result::Result<Part, String> {
        let fields: Vec<&str> = body.split("..").collect();
        if fields.len() < 2 || fields.len() > 3 {
            return Err(format!("range {body:?} must be start..end[..step]"));
        }
        let start_str = fields[0];
        let start: u64 = start_str
            .parse()
            .map_err(|_| format!("bad range start {start_str:?}"))?;
        let end: u64 = fields[1]
            .parse()
            .map_err(|_| format!("bad range end {:?}", fields[1]))?;
        let step: u64 = if fields.len() == 3 {
            fields[2]
                .parse()
                .map_err(|_| format!("bad range step {:?}", fields[2]))?
        } else {
            1
        };
        if step == 0 {
            return Err("step cannot be zero".to_string());
        }
        if end < start {
            return Err(format!("range end {end} precedes start {start}"));
        }
        let width = if start_str.len() > 1 && start_str.starts_with('0') {
            start_str.len()
        } else {
            0
        };
        Ok(Part::Range {
            start,
            end,
            step,
            width,
        })
    }

    /// Number of names the template expands to.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Text(_) => 1,
                Part::Range {
                    start, end, step, ..
                } => (end - start) / step + 1,
            })
            .product()
    }

    #[must_use]
    pub fn iter(&self) -> TemplateIter<'_> {
        TemplateIter {
            template: self,
            cursor: vec![0; self.parts.len()],
            done: false,
        }
    }
}

/// Odometer over all range positions, rightmost fastest.
pub struct TemplateIter<'a> {
    template: &'a ObjTemplate,
    cursor: Vec<u64>,
    done: bool,
}

impl Iterator for TemplateIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        let mut name = String::new();
        for (i, part) in self.template.parts.iter().enumerate() {
            match part {
                Part::Text(t) => name.push_str(t),
                Part::Range {
                    start, step, width, ..
                } => {
                    let v = start + self.cursor[i] * step;
                    if *width > 0 {
                        name.push_str(&format!("{v:0width$}"));
                    } else {
                        name.push_str(&v.to_string());
                    }
                }
            }
        }
        // advance rightmost-first
        self.done = true;
        for (i, part) in self.template.parts.iter().enumerate().rev() {
            if let Part::Range {
                start, end, step, ..
            } = part
            {
                let pos = &mut self.cursor[i];
                if start + (*pos + 1) * step <= *end {
                    *pos += 1;
                    self.done = false;
                    break;
                }
                *pos = 0;
            }
        }
        Some(name)
    }
}
