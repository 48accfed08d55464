//! Snapshot condenser.
//!
//! The driver hands back a [`RawSnapshot`] with whatever the page exposed. The
//! [`Condenser`] bounds it into a [`Snapshot`]: a capped, ordered list of
//! addressable elements plus salient text, safe to pattern-match and small
//! enough to hand to the decision maker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CondenserLimits;
use crate::error::{AgentError, Result};
use crate::types::{Locator, normalize_label};

/// Element exactly as reported by the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawElement {
    #[serde(rename = "ref")]
    pub reference: String,
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Label of the filter section a pill sits in, when the page shows one.
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<RawElement>,
    #[serde(default)]
    pub texts: Vec<String>,
}

/// Addressable element. `reference` is only valid for the current page load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub reference: String,
    pub role: String,
    pub name: String,
    pub value: Option<String>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub url: String,
    pub title: String,
    pub elements: Vec<Element>,
    pub texts: Vec<String>,
    /// Elements dropped by the condenser.
    pub omitted_elements: usize,
    pub captured_at: DateTime<Utc>,
}

pub struct Condenser {
    limits: CondenserLimits,
}

impl Condenser {
    pub fn new(limits: CondenserLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &CondenserLimits {
        &self.limits
    }

    pub fn condense(&self, raw: RawSnapshot) -> Snapshot {
        let mut elements = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut omitted = 0;

        for el in raw.elements {
            let role = el.role.trim().to_lowercase();
            let name = clip(el.name.split_whitespace().collect::<Vec<_>>().join(" ").as_str(), self.limits.max_label_chars);
            if role.is_empty() || el.reference.is_empty() {
                continue;
            }
            if !seen.insert((role.clone(), name.clone(), el.value.clone(), el.reference.clone())) {
                continue;
            }
            if elements.len() >= self.limits.max_elements {
                omitted += 1;
                continue;
            }
            elements.push(Element {
                reference: el.reference,
                role,
                name,
                value: el
                    .value
                    .filter(|v| !v.is_empty())
                    .map(|v| clip(&v, self.limits.max_label_chars)),
                section: el
                    .section
                    .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
                    .filter(|s| !s.is_empty())
                    .map(|s| clip(&s, self.limits.max_label_chars)),
            });
        }

        let mut texts = Vec::new();
        for text in raw.texts {
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if text.len() < 2 || texts.contains(&text) {
                continue;
            }
            if texts.len() >= self.limits.max_texts {
                break;
            }
            texts.push(clip(&text, self.limits.max_label_chars * 2));
        }

        Snapshot {
            url: raw.url,
            title: clip(&raw.title, self.limits.max_label_chars),
            elements,
            texts,
            omitted_elements: omitted,
            captured_at: Utc::now(),
        }
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

impl Snapshot {
    /// Stable digest of everything that describes page state. Element references
    /// and capture time are excluded so an unchanged page hashes the same.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update([0]);
        for el in &self.elements {
            hasher.update(el.role.as_bytes());
            hasher.update([1]);
            hasher.update(el.name.as_bytes());
            hasher.update([1]);
            hasher.update(el.value.as_deref().unwrap_or("").as_bytes());
            hasher.update([1]);
            hasher.update(el.section.as_deref().unwrap_or("").as_bytes());
            hasher.update([2]);
        }
        for text in &self.texts {
            hasher.update(text.as_bytes());
            hasher.update([3]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn element(&self, reference: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.reference == reference)
    }

    /// Elements matching `locator`, exact-name matches first. Falls back to
    /// substring matches only when nothing matches exactly.
    pub fn find(&self, locator: &Locator) -> Vec<&Element> {
        let wanted = normalize_label(&locator.name);
        let role_ok = |el: &&Element| {
            locator
                .role
                .as_ref()
                .is_none_or(|r| r.eq_ignore_ascii_case(&el.role))
        };
        let exact: Vec<&Element> = self
            .elements
            .iter()
            .filter(role_ok)
            .filter(|el| normalize_label(&el.name) == wanted)
            .collect();
        if !exact.is_empty() || wanted.is_empty() {
            return exact;
        }
        self.elements
            .iter()
            .filter(role_ok)
            .filter(|el| normalize_label(&el.name).contains(&wanted))
            .collect()
    }

    /// Resolve a semantic target to exactly one element.
    pub fn resolve(&self, locator: &Locator) -> Result<&Element> {
        let found = self.find(locator);
        match found.as_slice() {
            [] => Err(AgentError::TargetNotFound(locator.to_string())),
            [one] => Ok(one),
            many => Err(AgentError::AmbiguousTarget {
                target: locator.to_string(),
                candidates: many.len(),
            }),
        }
    }

    pub fn is_present(&self, locator: &Locator) -> bool {
        !self.find(locator).is_empty()
    }

    /// Case-insensitive search over title, salient text and element names.
    pub fn contains_text(&self, needle: &str) -> bool {
        let needle = normalize_label(needle);
        if needle.is_empty() {
            return false;
        }
        normalize_label(&self.title).contains(&needle)
            || self.texts.iter().any(|t| normalize_label(t).contains(&needle))
            || self
                .elements
                .iter()
                .any(|e| normalize_label(&e.name).contains(&needle))
    }

    /// A filter pill for `value` among elements whose role is one of `roles`.
    /// With `scopes` given, the pill must also sit in a section whose label is
    /// one of them; a pill with no known section never matches a scoped query.
    pub fn has_pill(&self, value: &str, roles: &[String], scopes: &[String]) -> bool {
        let wanted = normalize_label(value);
        self.elements.iter().any(|el| {
            roles.iter().any(|r| r.eq_ignore_ascii_case(&el.role))
                && normalize_label(&el.name) == wanted
                && (scopes.is_empty()
                    || el.section.as_deref().is_some_and(|section| {
                        let section = normalize_label(section);
                        scopes.iter().any(|s| normalize_label(s) == section)
                    }))
        })
    }

    /// Number shown next to `label`, e.g. "1,234 results" or "Rows: 85". When
    /// several numbers share a line the one immediately before the label wins,
    /// so "Showing 1-25 of 1,234 results" reads as 1234, except for progress
    /// such as "22 of 100 rows", which reads as 22.
    pub fn counter(&self, label: &str) -> Option<u64> {
        let label = normalize_label(label);
        if label.is_empty() {
            return None;
        }
        self.texts
            .iter()
            .map(String::as_str)
            .chain(self.elements.iter().map(|e| e.name.as_str()))
            .find_map(|text| counter_in(&normalize_label(text), &label))
    }

    /// Condensed text handed to the decision maker, capped at `max_chars`.
    pub fn render(&self, max_chars: usize) -> String {
        let mut out = format!("URL: {}\nTitle: {}\n\nElements:\n", self.url, self.title);
        for el in &self.elements {
            out.push_str(&format!("[{}] {} \"{}\"", el.reference, el.role, el.name));
            if let Some(value) = &el.value {
                out.push_str(&format!(" value=\"{value}\""));
            }
            if let Some(section) = &el.section {
                out.push_str(&format!(" in \"{section}\""));
            }
            out.push('\n');
        }
        if self.omitted_elements > 0 {
            out.push_str(&format!("(+{} more elements not shown)\n", self.omitted_elements));
        }
        if !self.texts.is_empty() {
            out.push_str("\nText:\n");
            for text in &self.texts {
                out.push_str(&format!("  \"{text}\"\n"));
            }
        }
        if out.len() > max_chars {
            let total = out.len();
            let mut cut = max_chars;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
            out.push_str(&format!("\n... [truncated, {total} total chars]"));
        }
        out
    }
}

fn counter_in(text: &str, label: &str) -> Option<u64> {
    let at = text.find(label)?;
    let numbers = numbers_in(text);
    let Some(k) = numbers.iter().rposition(|n| n.end <= at) else {
        return numbers.iter().find(|n| n.end > at).map(|n| n.value);
    };
    // "22 of 100 rows" and "22/100 rows" report progress toward a total; the
    // count is the first operand. A window such as "1-25 of 1,234" is not.
    if k > 0 {
        let (done, total) = (&numbers[k - 1], &numbers[k]);
        let joiner = text[done.end..total.start].trim();
        let windowed = k > 1 && text[numbers[k - 2].end..done.start].trim() == "-";
        if (joiner == "of" || joiner == "/") && !windowed {
            return Some(done.value);
        }
    }
    Some(numbers[k].value)
}

struct Number {
    start: usize,
    end: usize,
    value: u64,
}

/// Integers in `text` with their byte span. Thousands separators between
/// digits are accepted.
fn numbers_in(text: &str) -> Vec<Number> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        let mut digits = String::new();
        while i < bytes.len() {
            if bytes[i].is_ascii_digit() {
                digits.push(bytes[i] as char);
                i += 1;
            } else if bytes[i] == b','
                && i + 1 < bytes.len()
                && bytes[i + 1].is_ascii_digit()
                && !digits.is_empty()
            {
                i += 1;
            } else {
                break;
            }
        }
        if let Ok(value) = digits.parse() {
            out.push(Number { start, end: i, value });
        }
    }
    out
}
