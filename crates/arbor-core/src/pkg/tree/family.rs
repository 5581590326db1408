//! Ancestor `{name: version}` frames used by the install-path cycle check.
//!
//! Each tree level pushes a frame whose parent is the enclosing level's
//! frame. Frames are shared, so creating one is O(1) and a lookup walks at
//! most the depth of the tree.

use std::rc::Rc;

#[derive(Debug)]
struct Frame {
    name: String,
    version: String,
    parent: Family,
}

/// A persistent linked list of ancestor frames, innermost first.
#[derive(Debug, Clone, Default)]
pub struct Family(Option<Rc<Frame>>);

impl Family {
    /// The empty family (above the root).
    #[must_use]
    pub fn new() -> Self {
        Self(None)
    }

    /// A new frame for `name@version` on top of `self`.
    #[must_use]
    pub fn push(&self, name: &str, version: &str) -> Self {
        Self(Some(Rc::new(Frame {
            name: name.to_string(),
            version: version.to_string(),
            parent: self.clone(),
        })))
    }

    /// The enclosing family, or `None` at the outermost frame.
    #[must_use]
    pub fn parent(&self) -> Option<&Family> {
        self.0.as_ref().map(|f| &f.parent)
    }

    /// Whether any frame (starting `skip` levels out) records exactly `name@version`.
    #[must_use]
    pub fn contains(&self, name: &str, version: &str, skip: usize) -> bool {
        let mut cur = self;
        for _ in 0..skip {
            match cur.parent() {
                Some(p) => cur = p,
                None => return false,
            }
        }
        while let Some(frame) = &cur.0 {
            if frame.name == name && frame.version == version {
                return true;
            }
            cur = &frame.parent;
        }
        false
    }

    /// Number of frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = self;
        while let Some(frame) = &cur.0 {
            n += 1;
            cur = &frame.parent;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_shares_parent() {
        let root = Family::new().push("root", "1.0.0");
        let a = root.push("a", "1.0.0");
        let b = root.push("b", "2.0.0");

        assert_eq!(a.depth(), 2);
        assert_eq!(b.depth(), 2);
        assert!(a.contains("root", "1.0.0", 0));
        assert!(!a.contains("b", "2.0.0", 0));
    }

    #[test]
    fn test_contains_skips_levels() {
        let fam = Family::new().push("a", "1.0.0").push("b", "1.0.0");
        assert!(fam.contains("b", "1.0.0", 0));
        assert!(!fam.contains("b", "1.0.0", 1));
        assert!(fam.contains("a", "1.0.0", 1));
        assert!(!fam.contains("a", "1.0.0", 5));
    }

    #[test]
    fn test_version_must_match_exactly() {
        let fam = Family::new().push("a", "1.0.0");
        assert!(!fam.contains("a", "1.0.1", 0));
    }
}
