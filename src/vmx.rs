//! The host-resident `key = "value"` guest configuration text.
//!
//! Two views of the same text exist. [`ConfigDocument`] is the parsed,
//! key-sorted mapping; it drops anything that is not a `key = "value"` line.
//! The line-level patch functions work on the raw text instead and leave
//! every untouched line exactly as it was.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(.+?)\s*=\s*"(.*?)"\s*$"#).expect("static regex is valid")
});

/// Sentinel stored in place of `"` inside quoted values.
pub const QUOTE_SENTINEL: &str = "|22";

/// Parsed key/value view, serialized with keys in lexicographic order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    entries: BTreeMap<String, String>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| LINE_RE.captures(line))
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries under `prefix`, with the prefix stripped from their keys.
    pub fn strip_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|short| (short, v)))
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{}", format_line(key, value))?;
        }
        Ok(())
    }
}

pub fn format_line(key: &str, value: &str) -> String {
    format!("{key} = \"{value}\"")
}

pub fn escape_value(value: &str) -> String {
    value.replace('"', QUOTE_SENTINEL)
}

pub fn unescape_value(value: &str) -> String {
    value.replace(QUOTE_SENTINEL, "\"")
}

/// Key of a `key = ...` line, if it has one.
pub fn line_key(line: &str) -> Option<&str> {
    let (key, _) = line.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut text = String::new();
    for line in lines {
        text.push_str(line.as_ref());
        text.push('\n');
    }
    text
}

/// Replace the value of every `key` line, or append one if none exists.
pub fn set_value(text: &str, key: &str, value: &str) -> String {
    let replacement = format_line(key, value);
    let mut found = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            if line_key(line) == Some(key) {
                found = true;
                replacement.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(replacement);
    }
    join_lines(&lines)
}

/// Whether any line belongs to the family.
pub fn has_family_member(text: &str, is_member: &dyn Fn(&str) -> bool) -> bool {
    text.lines().filter_map(line_key).any(is_member)
}

/// Drop every line whose key belongs to the family.
pub fn remove_family(text: &str, is_member: &dyn Fn(&str) -> bool) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line_key(line).is_some_and(is_member))
        .collect();
    join_lines(&kept)
}

/// Strategy for rewriting an indexed key family in one step.
pub trait FamilyPatcher {
    fn replace_family(
        &self,
        text: &str,
        is_member: &dyn Fn(&str) -> bool,
        entries: &[(String, String)],
    ) -> String;
}

/// Delete every family line, then write the desired entries in their place.
///
/// Members not in `entries` disappear. The entries go where the first
/// removed line was, or at the end when the family was absent, so a second
/// pass with the same entries yields the same text.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceFamily;

impl FamilyPatcher for ReplaceFamily {
    fn replace_family(
        &self,
        text: &str,
        is_member: &dyn Fn(&str) -> bool,
        entries: &[(String, String)],
    ) -> String {
        let mut splice_at = None;
        let mut lines: Vec<String> = Vec::new();
        for line in text.lines() {
            if line_key(line).is_some_and(is_member) {
                splice_at.get_or_insert(lines.len());
            } else {
                lines.push(line.to_string());
            }
        }
        let at = splice_at.unwrap_or(lines.len());
        lines.splice(
            at..at,
            entries.iter().map(|(key, value)| format_line(key, value)),
        );
        join_lines(&lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#".encoding = "UTF-8"
config.version = "8"
# managed by hand
memSize = "512"
numvcpus = "1"
scsi0:0.fileName = "web01.vmdk"
scsi0:1.fileName = "/vmfs/volumes/ds1/data/a.vmdk"
scsi0:1.present = "true"
floppy0.present = "FALSE"
"#;

    fn is_extra_disk(key: &str) -> bool {
        key.starts_with("scsi0:1.") || key.starts_with("scsi0:2.")
    }

    #[test]
    fn parse_skips_non_key_value_lines() {
        let doc = ConfigDocument::parse(SAMPLE);
        assert_eq!(doc.len(), 8);
        assert_eq!(doc.get("memSize"), Some("512"));
        assert_eq!(doc.get(".encoding"), Some("UTF-8"));
        assert_eq!(doc.get("# managed by hand"), None);
    }

    #[test]
    fn parse_accepts_empty_values() {
        let doc = ConfigDocument::parse("ide1:0.fileName = \"\"\n");
        assert_eq!(doc.get("ide1:0.fileName"), Some(""));
    }

    #[test]
    fn serialize_sorts_keys() {
        let doc = ConfigDocument::parse("b = \"2\"\na = \"1\"\n");
        assert_eq!(doc.to_string(), "a = \"1\"\nb = \"2\"\n");
    }

    #[test]
    fn guestinfo_mapping_survives_serialize_and_parse() {
        let mut doc = ConfigDocument::default();
        doc.insert("guestinfo.metadata", "eyJob3N0IjoiYSJ9");
        doc.insert("guestinfo.metadata.encoding", "base64");
        doc.insert("guestinfo.user data", "x = y");
        let reparsed = ConfigDocument::parse(&doc.to_string());
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn strip_prefix_yields_short_keys() {
        let doc = ConfigDocument::parse("guestinfo.a = \"1\"\nguestinfo.b = \"2\"\nmemSize = \"1\"\n");
        let short: Vec<_> = doc.strip_prefix("guestinfo.").collect();
        assert_eq!(short, [("a", "1"), ("b", "2")]);
    }

    #[test]
    fn set_value_replaces_once_and_keeps_other_lines() {
        let patched = set_value(SAMPLE, "memSize", "2048");
        assert_eq!(patched.matches("memSize = \"2048\"").count(), 1);
        assert!(!patched.contains("memSize = \"512\""));

        let before: Vec<_> = SAMPLE.lines().filter(|l| !l.starts_with("memSize")).collect();
        let after: Vec<_> = patched.lines().filter(|l| !l.starts_with("memSize")).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn set_value_appends_missing_key() {
        let patched = set_value(SAMPLE, "annotation", "hello");
        assert!(patched.ends_with("annotation = \"hello\"\n"));
        assert!(patched.starts_with(SAMPLE));
    }

    #[test]
    fn set_value_does_not_match_key_prefixes() {
        let text = "numvcpus = \"2\"\nnuma.autosize.vcpu.maxPerVirtualNode = \"2\"\n";
        let patched = set_value(text, "numvcpus", "4");
        assert!(patched.contains("numa.autosize.vcpu.maxPerVirtualNode = \"2\""));
        assert!(patched.contains("numvcpus = \"4\""));
    }

    #[test]
    fn annotation_quotes_are_escaped_and_restored() {
        let notes = r#"say "hi" twice"#;
        let patched = set_value("", "annotation", &escape_value(notes));
        assert_eq!(patched, "annotation = \"say |22hi|22 twice\"\n");

        let doc = ConfigDocument::parse(&patched);
        assert_eq!(unescape_value(doc.get("annotation").unwrap()), notes);
    }

    #[test]
    fn replace_family_splices_at_first_member() {
        let entries = vec![
            ("scsi0:2.fileName".to_string(), "/vmfs/volumes/ds1/data/b.vmdk".to_string()),
            ("scsi0:2.present".to_string(), "true".to_string()),
        ];
        let patched = ReplaceFamily.replace_family(SAMPLE, &is_extra_disk, &entries);
        let lines: Vec<_> = patched.lines().collect();
        assert_eq!(lines[5], "scsi0:0.fileName = \"web01.vmdk\"");
        assert_eq!(lines[6], "scsi0:2.fileName = \"/vmfs/volumes/ds1/data/b.vmdk\"");
        assert_eq!(lines[7], "scsi0:2.present = \"true\"");
        assert_eq!(lines[8], "floppy0.present = \"FALSE\"");
        assert!(!patched.contains("a.vmdk"));
    }

    #[test]
    fn replace_family_appends_when_absent_and_is_stable() {
        let base = "memSize = \"512\"\n";
        let entries = vec![("scsi0:1.present".to_string(), "true".to_string())];
        let once = ReplaceFamily.replace_family(base, &is_extra_disk, &entries);
        assert_eq!(once, "memSize = \"512\"\nscsi0:1.present = \"true\"\n");
        let twice = ReplaceFamily.replace_family(&once, &is_extra_disk, &entries);
        assert_eq!(once, twice);
    }

    #[test]
    fn replace_family_with_no_entries_removes_members() {
        let patched = ReplaceFamily.replace_family(SAMPLE, &is_extra_disk, &[]);
        assert!(!has_family_member(&patched, &is_extra_disk));
        assert!(patched.contains("# managed by hand"));
    }

    #[test]
    fn remove_family_keeps_comments() {
        let patched = remove_family(SAMPLE, &|k: &str| k == "memSize");
        assert!(!patched.contains("memSize"));
        assert!(patched.contains("# managed by hand"));
    }
}
