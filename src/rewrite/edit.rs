// Purpose: Apply byte-range splice edits to a source file.
// Inputs/Outputs: Source text plus ordered edits in, rewritten text out.
// Invariants: Edits must not overlap; they are applied back to front.
// Gotchas: Offsets index the original text, never the partially edited one.

use anyhow::{Result, bail};

#[derive(Debug, Clone)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Edit {
    pub fn replace(start: usize, end: usize, text: String) -> Self {
        Self { start, end, text }
    }

    pub fn insert(at: usize, text: String) -> Self {
        Self {
            start: at,
            end: at,
            text,
        }
    }
}

pub fn apply(src: &str, mut edits: Vec<Edit>) -> Result<String> {
    edits.sort_by_key(|e| (e.start, e.end));
    for pair in edits.windows(2) {
        if pair[0].end > pair[1].start {
            bail!(
                "overlapping edits at {}..{} and {}..{}",
                pair[0].start,
                pair[0].end,
                pair[1].start,
                pair[1].end
            );
        }
    }
    let mut out = String::with_capacity(src.len());
    let mut cursor = 0usize;
    for edit in &edits {
        if edit.start > src.len() || edit.end > src.len() {
            bail!("edit out of bounds at {}..{}", edit.start, edit.end);
        }
        out.push_str(&src[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&src[cursor..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{Edit, apply};

    #[test]
    fn applies_replacements_and_inserts() {
        let src = "var x = 1";
        let edits = vec![
            Edit::replace(4, 5, "y".to_string()),
            Edit::insert(9, " // moved".to_string()),
        ];
        assert_eq!(apply(src, edits).expect("apply"), "var y = 1 // moved");
    }

    #[test]
    fn rejects_overlap() {
        let src = "abcdef";
        let edits = vec![
            Edit::replace(0, 3, "x".to_string()),
            Edit::replace(2, 4, "y".to_string()),
        ];
        assert!(apply(src, edits).is_err());
    }

    #[test]
    fn empty_edit_list_is_identity() {
        assert_eq!(apply("package p", Vec::new()).expect("apply"), "package p");
    }
}
