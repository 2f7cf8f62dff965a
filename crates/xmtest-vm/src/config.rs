//! Domain configuration documents and their xm config-file rendering.
//!
//! A [`ConfigDocument`] is an ordered set of options. Rendering produces the
//! exact text the control tool reads with `xm create`/`xm new`:
//!
//! ```text
//! # Xen configuration generated by xm-test
//! memory = 64
//! kernel = "/boot/vmlinuz-xen"
//! disk = ['phy:/dev/ram0,hda1,w']
//! ```

use crate::error::Result;
use crate::policy::SecurityPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// First line of every rendered config.
pub const CONFIG_HEADER: &str = "# Xen configuration generated by xm-test";

/// Options that are always list-typed.
pub const LIST_OPTIONS: [&str; 3] = ["disk", "vif", "vtpm"];

/// Option whose string values accumulate instead of being replaced.
const EXTRA_OPTION: &str = "extra";

/// Option naming the access-control label when ACM is enabled.
pub const ACCESS_CONTROL_OPTION: &str = "access_control";

/// A single option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Rendered as a bare number
    Int(i64),
    /// Rendered double-quoted
    Str(String),
    /// Rendered as a list literal
    List(Vec<String>),
}

impl ConfigValue {
    /// Whether this value is list-typed.
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// String contents, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// List contents, if this is a list value.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    fn into_scalar_string(self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s,
            Self::List(items) => list_literal(&items),
        }
    }

    /// Render the right-hand side of a config line, or `None` when the
    /// value is omitted from the file.
    ///
    /// Integers are always written, including zero (`acpi = 0` is a
    /// meaningful setting). Empty strings and empty lists are dropped.
    fn render(&self) -> Option<String> {
        match self {
            Self::Int(n) => Some(n.to_string()),
            Self::List(items) if !items.is_empty() => Some(list_literal(items)),
            Self::Str(s) if !s.is_empty() => Some(format!("\"{s}\"")),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::List(items) => write!(f, "{}", list_literal(items)),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for ConfigValue {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for ConfigValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(String::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ConfigValue {
    fn from(value: [&str; N]) -> Self {
        Self::List(value.iter().map(|s| s.to_string()).collect())
    }
}

/// Python-style list literal: `['a', 'b']`.
fn list_literal(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| quote_item(item)).collect();
    format!("[{}]", quoted.join(", "))
}

/// Quote one list entry the way the tool's config parser expects.
///
/// Single quotes are preferred; double quotes are used when the text holds
/// a single quote but no double quote. Non-printable and non-ASCII bytes are
/// written as `\xNN` escapes.
fn quote_item(item: &str) -> String {
    let quote = if item.contains('\'') && !item.contains('"') {
        '"'
    } else {
        '\''
    };

    let mut out = String::with_capacity(item.len() + 2);
    out.push(quote);
    for c in item.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
            }
        }
    }
    out.push(quote);
    out
}

/// In-memory configuration for one domain.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    instance_id: Uuid,
    defaults: Vec<(String, ConfigValue)>,
    opts: Vec<(String, ConfigValue)>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDocument {
    /// Create a document holding only the list-typed defaults.
    pub fn new() -> Self {
        let defaults: Vec<(String, ConfigValue)> = LIST_OPTIONS
            .iter()
            .map(|name| (name.to_string(), ConfigValue::List(Vec::new())))
            .collect();

        Self {
            instance_id: Uuid::new_v4(),
            opts: defaults.clone(),
            defaults,
        }
    }

    /// Create a document whose defaults carry an access-control label,
    /// so that domains can start with the security module enforcing.
    pub fn with_access_control(policy: &str, label: &str) -> Self {
        let mut doc = Self::new();
        let entry = (
            ACCESS_CONTROL_OPTION.to_string(),
            ConfigValue::List(vec![format!("policy={policy},label={label}")]),
        );
        doc.defaults.push(entry.clone());
        doc.opts.push(entry);
        doc
    }

    /// Unique id of this document instance.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.opts.iter().position(|(key, _)| key == name)
    }

    /// Set an option.
    ///
    /// A scalar written to a list option becomes a one-element list. A
    /// string written to an existing `extra` option is appended after a
    /// space. Anything else replaces the current value.
    pub fn set_opt(&mut self, name: &str, value: impl Into<ConfigValue>) {
        let value = value.into();
        let Some(idx) = self.position(name) else {
            self.opts.push((name.to_string(), value));
            return;
        };

        let slot = &mut self.opts[idx].1;
        if slot.is_list() && !value.is_list() {
            *slot = ConfigValue::List(vec![value.into_scalar_string()]);
            return;
        }
        if name == EXTRA_OPTION && !value.is_list() {
            if let ConfigValue::Str(existing) = slot {
                existing.push(' ');
                existing.push_str(&value.into_scalar_string());
                return;
            }
        }
        *slot = value;
    }

    /// Append an entry to a list option.
    ///
    /// Returns `false` and leaves the document untouched when the option is
    /// absent or not list-typed.
    pub fn append_opt(&mut self, name: &str, value: impl Into<String>) -> bool {
        match self.opts.iter_mut().find(|(key, _)| key == name) {
            Some((_, ConfigValue::List(items))) => {
                items.push(value.into());
                true
            }
            _ => {
                tracing::debug!(option = name, "append ignored: not a list option");
                false
            }
        }
    }

    /// Remove the first matching entry from a list option.
    pub fn remove_entry(&mut self, name: &str, value: &str) -> bool {
        if let Some((_, ConfigValue::List(items))) =
            self.opts.iter_mut().find(|(key, _)| key == name)
        {
            if let Some(pos) = items.iter().position(|item| item == value) {
                items.remove(pos);
                return true;
            }
        }
        false
    }

    /// Get an option value, `None` when unset.
    pub fn get_opt(&self, name: &str) -> Option<&ConfigValue> {
        self.opts
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// The `name` option, when set to a string.
    pub fn name(&self) -> Option<&str> {
        self.get_opt("name").and_then(ConfigValue::as_str)
    }

    /// Apply [`set_opt`](Self::set_opt) to every entry, in iteration order.
    pub fn set_opts<I, K, V>(&mut self, opts: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ConfigValue>,
    {
        for (name, value) in opts {
            self.set_opt(name.as_ref(), value);
        }
    }

    /// Reset one option to its default (unset if it has none), or the whole
    /// document when `name` is `None`.
    pub fn clear_opts(&mut self, name: Option<&str>) {
        let Some(name) = name else {
            self.opts = self.defaults.clone();
            return;
        };

        let default = self
            .defaults
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone());

        match (self.position(name), default) {
            (Some(idx), Some(value)) => self.opts[idx].1 = value,
            (None, Some(value)) => self.opts.push((name.to_string(), value)),
            (Some(idx), None) => {
                self.opts.remove(idx);
            }
            (None, None) => {}
        }
    }

    /// Iterate over options in insertion order.
    pub fn options(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.opts.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Render the document in config-file syntax.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(CONFIG_HEADER);
        out.push('\n');
        for (key, value) in &self.opts {
            if let Some(rhs) = value.render() {
                out.push_str(&format!("{key} = {rhs}\n"));
            }
        }
        out
    }

    /// Write the rendered document to `path`, then run the security policy
    /// hook if it is enabled.
    pub async fn persist(&self, path: &Path, policy: &dyn SecurityPolicy) -> Result<()> {
        let rendered = self.render();
        {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(rendered.as_bytes()).await?;
            file.flush().await?;
        }
        tracing::debug!(path = %path.display(), "Config written");

        if policy.enabled() {
            policy.prepare(self).await?;
        }
        Ok(())
    }

    /// File name used by [`persist_transient`](Self::persist_transient).
    pub fn transient_file_name(&self) -> String {
        match self.name().filter(|name| !name.is_empty()) {
            Some(name) => format!("xm-test-{}.conf", name.replace(['/', '\\'], "_")),
            None => format!("xm-test-{}.conf", self.instance_id),
        }
    }

    /// Persist to a path unique to this document inside `dir` and return
    /// that path, for passing the config to the tool by file name.
    pub async fn persist_transient(
        &self,
        dir: &Path,
        policy: &dyn SecurityPolicy,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.transient_file_name());
        self.persist(&path, policy).await?;
        Ok(path)
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NoSecurityPolicy;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_list_options_default_empty() {
        let doc = ConfigDocument::new();
        for name in LIST_OPTIONS {
            assert_eq!(doc.get_opt(name), Some(&ConfigValue::List(vec![])));
        }
    }

    #[test]
    fn test_scalar_into_list_option_wraps() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("disk", "x");
        assert_eq!(doc.get_opt("disk"), Some(&ConfigValue::from(vec!["x"])));

        doc.set_opt("disk", "y");
        assert_eq!(doc.get_opt("disk"), Some(&ConfigValue::from(vec!["y"])));

        doc.set_opt("vif", 3);
        assert_eq!(doc.get_opt("vif"), Some(&ConfigValue::from(vec!["3"])));
    }

    #[test]
    fn test_list_into_list_option_replaces() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("disk", vec!["a", "b"]);
        doc.set_opt("disk", vec!["c"]);
        assert_eq!(doc.get_opt("disk"), Some(&ConfigValue::from(vec!["c"])));
    }

    #[test]
    fn test_extra_accumulates() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("extra", "a");
        doc.set_opt("extra", "b");
        assert_eq!(doc.get_opt("extra"), Some(&ConfigValue::from("a b")));
    }

    #[test]
    fn test_other_options_overwrite() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("root", "/dev/ram0");
        doc.set_opt("root", "/dev/sda1");
        assert_eq!(doc.get_opt("root"), Some(&ConfigValue::from("/dev/sda1")));
    }

    #[test]
    fn test_append_to_non_list_is_noop() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("memory", 64);
        assert!(!doc.append_opt("memory", "128"));
        assert_eq!(doc.get_opt("memory"), Some(&ConfigValue::Int(64)));

        assert!(!doc.append_opt("missing", "x"));
        assert!(doc.get_opt("missing").is_none());
    }

    #[test]
    fn test_get_absent_option() {
        let doc = ConfigDocument::new();
        assert!(doc.get_opt("kernel").is_none());
        assert!(doc.name().is_none());
    }

    #[test]
    fn test_set_opts_applies_in_order() {
        let mut doc = ConfigDocument::new();
        doc.set_opts([("extra", "console=ttyS0"), ("extra", "quiet")]);
        assert_eq!(
            doc.get_opt("extra"),
            Some(&ConfigValue::from("console=ttyS0 quiet"))
        );
    }

    #[test]
    fn test_clear_single_option() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("disk", "phy:/dev/ram0,hda1,w");
        doc.set_opt("memory", 64);

        doc.clear_opts(Some("disk"));
        assert_eq!(doc.get_opt("disk"), Some(&ConfigValue::List(vec![])));

        doc.clear_opts(Some("memory"));
        assert!(doc.get_opt("memory").is_none());
    }

    #[test]
    fn test_clear_all_options() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("memory", 64);
        doc.append_opt("vif", "bridge=xenbr0");

        doc.clear_opts(None);
        assert!(doc.get_opt("memory").is_none());
        assert_eq!(doc.get_opt("vif"), Some(&ConfigValue::List(vec![])));
    }

    #[test]
    fn test_clear_does_not_leak_into_defaults() {
        let mut doc = ConfigDocument::new();
        doc.append_opt("disk", "phy:/dev/ram0,hda1,w");
        doc.clear_opts(None);
        doc.append_opt("disk", "phy:/dev/ram1,hdb1,w");
        doc.clear_opts(None);
        assert_eq!(doc.get_opt("disk"), Some(&ConfigValue::List(vec![])));
    }

    #[test]
    fn test_render_header_only_when_empty() {
        let doc = ConfigDocument::new();
        assert_eq!(doc.render(), format!("{CONFIG_HEADER}\n"));
    }

    #[test]
    fn test_render_omits_empty_values() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("root", "");
        doc.set_opt("memory", 64);
        doc.set_opt("acpi", 0);

        let rendered = doc.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines, vec![CONFIG_HEADER, "memory = 64", "acpi = 0"]);
    }

    #[test]
    fn test_render_disk_example() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("disk", vec!["phy:/dev/ram0,hda1,w"]);
        assert!(doc.append_opt("disk", "phy:/dev/ram1,hdb1,w"));

        let rendered = doc.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], CONFIG_HEADER);
        assert_eq!(
            lines[1],
            "disk = ['phy:/dev/ram0,hda1,w', 'phy:/dev/ram1,hdb1,w']"
        );
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_render_string_and_int() {
        let mut doc = ConfigDocument::new();
        doc.set_opt("foo", "bar");
        doc.set_opt("foob", 1);
        assert_eq!(
            doc.to_string(),
            format!("{CONFIG_HEADER}\nfoo = \"bar\"\nfoob = 1\n")
        );
    }

    #[test]
    fn test_quote_item_escapes() {
        assert_eq!(quote_item("plain"), "'plain'");
        assert_eq!(quote_item("it's"), "\"it's\"");
        assert_eq!(quote_item("a'b\"c"), "'a\\'b\"c'");
        assert_eq!(quote_item("back\\slash"), "'back\\\\slash'");
        assert_eq!(quote_item("tab\there"), "'tab\\there'");
    }

    #[test]
    fn test_access_control_default() {
        let mut doc = ConfigDocument::with_access_control("xm-test", "red");
        assert_eq!(
            doc.get_opt(ACCESS_CONTROL_OPTION),
            Some(&ConfigValue::from(vec!["policy=xm-test,label=red"]))
        );

        doc.set_opt(ACCESS_CONTROL_OPTION, "policy=xm-test,label=blue");
        doc.clear_opts(Some(ACCESS_CONTROL_OPTION));
        assert_eq!(
            doc.get_opt(ACCESS_CONTROL_OPTION),
            Some(&ConfigValue::from(vec!["policy=xm-test,label=red"]))
        );
    }

    #[test]
    fn test_remove_entry() {
        let mut doc = ConfigDocument::new();
        doc.append_opt("vif", "mac=00:16:3e:00:00:01");
        assert!(doc.remove_entry("vif", "mac=00:16:3e:00:00:01"));
        assert!(!doc.remove_entry("vif", "mac=00:16:3e:00:00:01"));
        assert_eq!(doc.get_opt("vif"), Some(&ConfigValue::List(vec![])));
    }

    #[test]
    fn test_value_deserialization() {
        let value: ConfigValue = serde_json::from_str("64").unwrap();
        assert_eq!(value, ConfigValue::Int(64));
        let value: ConfigValue = serde_json::from_str("\"hvm\"").unwrap();
        assert_eq!(value, ConfigValue::from("hvm"));
        let value: ConfigValue = serde_json::from_str("[\"a\"]").unwrap();
        assert_eq!(value, ConfigValue::from(vec!["a"]));
    }

    #[test]
    fn test_transient_file_name() {
        let mut doc = ConfigDocument::new();
        assert_eq!(
            doc.transient_file_name(),
            format!("xm-test-{}.conf", doc.instance_id())
        );

        doc.set_opt("name", "01_create-1700000000");
        assert_eq!(
            doc.transient_file_name(),
            "xm-test-01_create-1700000000.conf"
        );
    }

    struct RecordingPolicy {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SecurityPolicy for RecordingPolicy {
        fn enabled(&self) -> bool {
            true
        }

        async fn prepare(&self, config: &ConfigDocument) -> crate::Result<()> {
            let names: Vec<String> = config.options().map(|(k, _)| k.to_string()).collect();
            *self.seen.lock().unwrap() = names;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persist_writes_and_runs_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domain.conf");

        let mut doc = ConfigDocument::new();
        doc.set_opt("memory", 64);

        let policy = RecordingPolicy {
            seen: Mutex::new(Vec::new()),
        };
        doc.persist(&path, &policy).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, doc.render());
        assert_eq!(
            *policy.seen.lock().unwrap(),
            vec!["disk", "vif", "vtpm", "memory"]
        );
    }

    #[tokio::test]
    async fn test_persist_transient_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let first = ConfigDocument::new();
        let second = ConfigDocument::new();

        let a = first
            .persist_transient(dir.path(), &NoSecurityPolicy)
            .await
            .unwrap();
        let b = second
            .persist_transient(dir.path(), &NoSecurityPolicy)
            .await
            .unwrap();

        assert_ne!(a, b);
        assert!(a.exists());
        assert!(b.exists());
    }
}
