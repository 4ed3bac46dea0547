//! Line segmentation for ordered substitutions.
//!
//! Text produced by one substitution is locked so that later patterns in
//! the chain never re-match it.

use regex::{Captures, Regex};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Segment {
    pub text: String,
    pub locked: bool,
}

pub(crate) fn open(text: &str) -> Vec<Segment> {
    vec![Segment {
        text: text.to_string(),
        locked: false,
    }]
}

/// Apply `re` to every unlocked segment. Each match is replaced by the
/// output of `replace` and locked; text between matches stays open.
pub(crate) fn substitute<F>(segments: Vec<Segment>, re: &Regex, mut replace: F) -> Vec<Segment>
where
    F: FnMut(&Captures) -> String,
{
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        if seg.locked {
            out.push(seg);
            continue;
        }
        let mut last = 0;
        for caps in re.captures_iter(&seg.text) {
            let Some(m) = caps.get(0) else { continue };
            if m.start() > last {
                out.push(Segment {
                    text: seg.text[last..m.start()].to_string(),
                    locked: false,
                });
            }
            out.push(Segment {
                text: replace(&caps),
                locked: true,
            });
            last = m.end();
        }
        if last < seg.text.len() {
            out.push(Segment {
                text: seg.text[last..].to_string(),
                locked: false,
            });
        }
    }
    out
}

pub(crate) fn join(segments: &[Segment]) -> String {
    segments.iter().map(|s| s.text.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_text_is_not_rematched() {
        let a = Regex::new(r"x").unwrap();
        let b = Regex::new(r"y").unwrap();
        let segs = substitute(open("axby"), &a, |_| "y".to_string());
        let segs = substitute(segs, &b, |_| "Z".to_string());
        assert_eq!(join(&segs), "aybZ");
        assert_eq!(segs.iter().filter(|s| s.locked).count(), 2);
    }
}
