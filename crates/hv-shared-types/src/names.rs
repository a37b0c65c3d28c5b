//! Isolation-tagged names
//!
//! VMs and networks that belong to one lab instance carry the instance's
//! isolation tag after a `#`, e.g. `db#abc123` or `corp#abc123`. Names
//! without the delimiter are shared (stock) resources.

pub const TAG_DELIMITER: char = '#';

pub trait IsolationName {
    /// Portion after the delimiter, or an empty string for shared names.
    fn tag(&self) -> &str;

    /// Portion before the delimiter.
    fn untagged(&self) -> &str;

    fn is_tagged(&self) -> bool;

    /// Appends `#tag` unless the name already carries a tag or `tag` is empty.
    fn with_tag(&self, tag: &str) -> String;
}

impl IsolationName for str {
    fn tag(&self) -> &str {
        match self.find(TAG_DELIMITER) {
            Some(idx) => &self[idx + 1..],
            None => "",
        }
    }

    fn untagged(&self) -> &str {
        match self.find(TAG_DELIMITER) {
            Some(idx) => &self[..idx],
            None => self,
        }
    }

    fn is_tagged(&self) -> bool {
        self.contains(TAG_DELIMITER)
    }

    fn with_tag(&self, tag: &str) -> String {
        if tag.is_empty() || self.is_tagged() {
            self.to_string()
        } else {
            format!("{}{}{}", self, TAG_DELIMITER, tag)
        }
    }
}

impl IsolationName for String {
    fn tag(&self) -> &str {
        self.as_str().tag()
    }

    fn untagged(&self) -> &str {
        self.as_str().untagged()
    }

    fn is_tagged(&self) -> bool {
        self.as_str().is_tagged()
    }

    fn with_tag(&self, tag: &str) -> String {
        self.as_str().with_tag(tag)
    }
}
