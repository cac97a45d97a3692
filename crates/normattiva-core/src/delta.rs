//! Line-based patches between version texts.
//!
//! A [`Patch`] rebuilds a target text from its base with two operations:
//! copy a run of base lines, or insert literal lines. Lines keep their
//! trailing newline, so applying a patch reproduces the target byte for byte.

use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices, Algorithm, DiffTag};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Copy { start: usize, len: usize },
    Insert { lines: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

fn lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

impl Patch {
    /// Compute the patch that turns `old` into `new`.
    pub fn diff(old: &str, new: &str) -> Patch {
        let old_lines = lines(old);
        let new_lines = lines(new);
        let mut ops: Vec<PatchOp> = Vec::new();

        for op in capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines) {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => match ops.last_mut() {
                    Some(PatchOp::Copy { start, len }) if *start + *len == old_range.start => {
                        *len += old_range.len();
                    }
                    _ => ops.push(PatchOp::Copy {
                        start: old_range.start,
                        len: old_range.len(),
                    }),
                },
                DiffTag::Delete => {}
                DiffTag::Insert | DiffTag::Replace => {
                    let inserted = new_lines[new_range].iter().map(|l| l.to_string());
                    match ops.last_mut() {
                        Some(PatchOp::Insert { lines }) => lines.extend(inserted),
                        _ => ops.push(PatchOp::Insert {
                            lines: inserted.collect(),
                        }),
                    }
                }
            }
        }
        Patch { ops }
    }

    /// Apply to `base`. Fails if a copy reaches past the end of the base.
    pub fn apply(&self, base: &str) -> Result<String, String> {
        let base_lines = lines(base);
        let mut out = String::with_capacity(base.len());
        for op in &self.ops {
            match op {
                PatchOp::Copy { start, len } => {
                    let end = start
                        .checked_add(*len)
                        .filter(|end| *end <= base_lines.len())
                        .ok_or_else(|| {
                            format!(
                                "copy of lines {start}..{} exceeds base of {} lines",
                                start.saturating_add(*len),
                                base_lines.len()
                            )
                        })?;
                    for line in &base_lines[*start..end] {
                        out.push_str(line);
                    }
                }
                PatchOp::Insert { lines } => {
                    for line in lines {
                        out.push_str(line);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Bytes of literal text carried by the patch.
    pub fn inserted_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                PatchOp::Copy { .. } => 0,
                PatchOp::Insert { lines } => lines.iter().map(String::len).sum(),
            })
            .sum()
    }
}

/// Line similarity in `[0, 1]`: `2 * equal / (old + new)`.
pub fn similarity(old: &str, new: &str) -> f64 {
    let old_lines = lines(old);
    let new_lines = lines(new);
    let total = old_lines.len() + new_lines.len();
    if total == 0 {
        return 1.0;
    }
    let equal: usize = capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines)
        .iter()
        .map(|op| {
            let (tag, old_range, _) = op.as_tag_tuple();
            if tag == DiffTag::Equal {
                old_range.len()
            } else {
                0
            }
        })
        .sum();
    2.0 * equal as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: &str = "§ art1\nUno.\n§ art2\nDue.\n§ art3\nTre.\n";
    const V2: &str = "§ art1\nUno.\n§ art2\nDue modificato.\n§ art3\nTre.\n§ art4\nQuattro.\n";

    #[test]
    fn test_patch_reproduces_target() {
        let patch = Patch::diff(V1, V2);
        assert_eq!(patch.apply(V1).unwrap(), V2);
    }

    #[test]
    fn test_patch_handles_missing_trailing_newline() {
        let old = "a\nb";
        let new = "a\nc";
        assert_eq!(Patch::diff(old, new).apply(old).unwrap(), new);
        assert_eq!(Patch::diff("", new).apply("").unwrap(), new);
        assert_eq!(Patch::diff(old, "").apply(old).unwrap(), "");
    }

    #[test]
    fn test_patch_only_carries_changed_lines() {
        let patch = Patch::diff(V1, V2);
        assert_eq!(
            patch.inserted_bytes(),
            "Due modificato.\n§ art4\nQuattro.\n".len()
        );
    }

    #[test]
    fn test_out_of_range_copy_is_rejected() {
        let patch = Patch {
            ops: vec![PatchOp::Copy { start: 2, len: 5 }],
        };
        assert!(patch.apply("a\nb\n").is_err());
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity(V1, V1), 1.0);
        assert_eq!(similarity("a\n", "b\n"), 0.0);
        let s = similarity(V1, V2);
        assert!(s > 0.6 && s < 1.0, "similarity {s}");
    }
}
