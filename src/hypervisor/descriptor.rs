// ============================================================================
// File: src/hypervisor/descriptor.rs
// ----------------------------------------------------------------------------
// Targeted edits to libvirt domain XML.
//
// Only the handful of fields cloning needs are read or written: the domain
// name and UUID, interface MAC addresses, and file-backed disk sources.
// Everything else passes through byte for byte.
// ============================================================================

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{CloneError, CloneResult};

/// File-backed disk as declared in a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDisk {
    pub source: String,
    pub target: String,
    pub format: String,
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Value span of `attr` inside the attribute text of a single tag
fn find_attr(tag: &str, attr: &str) -> Option<(usize, usize)> {
    let mut search = 0;
    while let Some(found) = tag[search..].find(attr) {
        let idx = search + found;
        search = idx + attr.len();

        if idx > 0 && !tag[..idx].ends_with(char::is_whitespace) {
            continue;
        }
        let Some(after_eq) = tag[search..].trim_start().strip_prefix('=') else {
            continue;
        };
        let after_eq = after_eq.trim_start();
        let quote = after_eq.chars().next()?;
        if quote != '\'' && quote != '"' {
            continue;
        }
        let value_start = tag.len() - after_eq.len() + 1;
        let value_end = value_start + tag[value_start..].find(quote)?;
        return Some((value_start, value_end));
    }
    None
}

/// Absolute byte spans of every `attr` value on `<element ...>` tags
fn attribute_spans(xml: &str, element: &str, attr: &str) -> Vec<(usize, usize)> {
    let open = format!("<{element}");
    let mut spans = Vec::new();
    let mut pos = 0;

    while let Some(found) = xml[pos..].find(&open) {
        let after = pos + found + open.len();
        let Some(close) = xml[after..].find('>') else {
            break;
        };
        let end = after + close;
        let tag = &xml[after..end];
        if tag.starts_with(char::is_whitespace) {
            if let Some((start, stop)) = find_attr(tag, attr) {
                spans.push((after + start, after + stop));
            }
        }
        pos = end;
    }
    spans
}

/// Replace spans back to front so earlier offsets stay valid
fn replace_spans<F>(xml: &str, spans: &[(usize, usize)], mut replacement: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = xml.to_string();
    for &(start, end) in spans.iter().rev() {
        if let Some(new) = replacement(&xml[start..end]) {
            out.replace_range(start..end, &new);
        }
    }
    out
}

/// Text of the first `<tag>...</tag>`
pub fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(&xml[start..end])
}

fn set_element_text(xml: &str, tag: &str, value: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    let mut out = xml.to_string();
    out.replace_range(start..end, &escape(value));
    Some(out)
}

/// Domain name
pub fn domain_name(xml: &str) -> Option<String> {
    element_text(xml, "name").map(unescape)
}

/// Rename the domain and give it a fresh UUID
pub fn rename(xml: &str, new_name: &str) -> CloneResult<String> {
    let renamed = set_element_text(xml, "name", new_name).ok_or_else(|| {
        CloneError::hypervisor("clone_descriptor", "Descriptor has no <name> element")
    })?;
    let uuid = Uuid::new_v4().to_string();
    Ok(set_element_text(&renamed, "uuid", &uuid).unwrap_or(renamed))
}

/// Locally administered MAC in the QEMU/KVM range
pub fn generate_mac() -> String {
    let bytes = Uuid::new_v4();
    let b = bytes.as_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2])
}

/// Give every interface a new MAC address
pub fn randomize_macs(xml: &str) -> String {
    let spans = attribute_spans(xml, "mac", "address");
    replace_spans(xml, &spans, |_| Some(generate_mac()))
}

/// Every `<source file='...'>` value in document order
pub fn disk_sources(xml: &str) -> Vec<String> {
    attribute_spans(xml, "source", "file")
        .into_iter()
        .map(|(start, end)| unescape(&xml[start..end]))
        .collect()
}

/// Point disk sources at new paths; sources not in `mapping` are untouched
pub fn rewrite_disk_sources(xml: &str, mapping: &HashMap<String, String>) -> String {
    let spans = attribute_spans(xml, "source", "file");
    replace_spans(xml, &spans, |current| {
        mapping.get(&unescape(current)).map(|new| escape(new))
    })
}

/// File-backed disks (`device='disk'`), in declaration order
pub fn disks(xml: &str) -> Vec<DescriptorDisk> {
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(start) = xml[pos..].find("<disk") {
        let block_start = pos + start;
        let Some(len) = xml[block_start..].find("</disk>") else {
            break;
        };
        let block = &xml[block_start..block_start + len];
        pos = block_start + len;

        let head_end = block.find('>').unwrap_or(block.len());
        let head = &block[..head_end];
        let attr = |a: &str| find_attr(head, a).map(|(s, e)| &head[s..e]);
        if attr("type") != Some("file") || attr("device").is_some_and(|d| d != "disk") {
            continue;
        }

        let first = |element: &str, name: &str| {
            attribute_spans(block, element, name)
                .first()
                .map(|&(s, e)| unescape(&block[s..e]))
        };
        if let Some(source) = first("source", "file") {
            found.push(DescriptorDisk {
                source,
                target: first("target", "dev").unwrap_or_default(),
                format: first("driver", "type").unwrap_or_else(|| "raw".to_string()),
            });
        }
    }
    found
}
