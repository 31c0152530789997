//! Meta-bullets: the exemplars each side is recognized by.
//!
//! Left favors prescriptive, verifiable, procedural knowledge. Right favors
//! exploratory, contrarian, possibility-expanding knowledge.

use playbook_core::{BulletKind, Group};

pub struct MetaBullet {
    pub side: Group,
    /// Embedded and compared against candidate text.
    pub text: &'static str,
    /// Phrases whose presence counts as a hit for this exemplar.
    pub keywords: &'static [&'static str],
}

pub const META_BULLETS: &[MetaBullet] = &[
    // Left
    MetaBullet {
        side: Group::Left,
        text: "always never must ensure require absolute rule",
        keywords: &["always", "never", "must", "ensure", "require"],
    },
    MetaBullet {
        side: Group::Left,
        text: "check validate verify confirm validation verification step",
        keywords: &["check", "validate", "verify", "confirm", "validation"],
    },
    MetaBullet {
        side: Group::Left,
        text: "required mandatory fields must have constraints",
        keywords: &["required", "mandatory", "must have"],
    },
    MetaBullet {
        side: Group::Left,
        text: "binary answer yes no true false pass fail",
        keywords: &["yes/no", "true/false", "pass/fail", "yes or no", "true or false"],
    },
    MetaBullet {
        side: Group::Left,
        text: "select one choice from defined options which of",
        keywords: &["which of", "select from", "choose between", "one of the options"],
    },
    MetaBullet {
        side: Group::Left,
        text: "step by step procedure checklist first then next finally",
        keywords: &["step by step", "step-by-step", "checklist", "procedure", "first,", "then "],
    },
    MetaBullet {
        side: Group::Left,
        text: "exact format schema specification structure",
        keywords: &["schema", "format", "exact", "specification"],
    },
    MetaBullet {
        side: Group::Left,
        text: "avoid prevent watch for known error pitfall",
        keywords: &["avoid", "prevent", "watch for", "do not", "don't"],
    },
    MetaBullet {
        side: Group::Left,
        text: "confirm known pattern established rule",
        keywords: &["known pattern", "established", "as expected", "standard"],
    },
    MetaBullet {
        side: Group::Left,
        text: "replicate proven procedure repeat what worked",
        keywords: &["proven", "replicate", "reuse", "same as before"],
    },
    MetaBullet {
        side: Group::Left,
        text: "logic constraint driven deterministic reasoning",
        keywords: &["constraint", "deterministic", "logic", "guarantee"],
    },
    // Right
    MetaBullet {
        side: Group::Right,
        text: "try consider explore experiment maybe exploratory",
        keywords: &["try", "consider", "explore", "experiment", "maybe", "perhaps"],
    },
    MetaBullet {
        side: Group::Right,
        text: "alternative variant different approach another way",
        keywords: &["alternative", "variant", "different approach", "another way", "instead"],
    },
    MetaBullet {
        side: Group::Right,
        text: "what if question whether assume reconsider assumption",
        keywords: &["what if", "question whether", "assume", "reconsider", "assumption"],
    },
    MetaBullet {
        side: Group::Right,
        text: "why how come what causes explanation",
        keywords: &["why", "how come", "what causes"],
    },
    MetaBullet {
        side: Group::Right,
        text: "what else what other could we expand possibilities",
        keywords: &["what else", "what other", "could we", "what if we"],
    },
    MetaBullet {
        side: Group::Right,
        text: "breaks pattern unexpected contradicts anomaly surprising",
        keywords: &["breaks pattern", "unexpected", "contradicts", "anomaly", "surprising"],
    },
    MetaBullet {
        side: Group::Right,
        text: "edge case corner case unusual scenario boundary",
        keywords: &["edge case", "corner case", "unusual", "boundary"],
    },
    MetaBullet {
        side: Group::Right,
        text: "reframe combine remix analogous creative recombination",
        keywords: &["reframe", "combine", "remix", "analogous", "analogy"],
    },
    MetaBullet {
        side: Group::Right,
        text: "novel approach unconventional break from tradition",
        keywords: &["novel", "unconventional", "creative", "untried"],
    },
    MetaBullet {
        side: Group::Right,
        text: "mutate pattern variation tweak deviate",
        keywords: &["mutate", "variation", "tweak", "deviate"],
    },
    MetaBullet {
        side: Group::Right,
        text: "abstract conceptual analogy metaphor like a",
        keywords: &["abstract", "conceptual", "metaphor", "is like"],
    },
];

pub fn for_side(side: Group) -> impl Iterator<Item = &'static MetaBullet> {
    META_BULLETS.iter().filter(move |m| m.side == side)
}

/// Kinds that lean toward one side. Used only as a small scoring bonus.
pub fn kind_side(kind: BulletKind) -> Option<Group> {
    match kind {
        BulletKind::Checklist | BulletKind::ToolRule | BulletKind::Template => Some(Group::Left),
        BulletKind::Concept | BulletKind::Question => Some(Group::Right),
        _ => None,
    }
}

/// Whether `keyword` occurs in `lowered` on word boundaries.
pub fn contains_keyword(lowered: &str, keyword: &str) -> bool {
    let kw = keyword.trim();
    if kw.is_empty() {
        return false;
    }
    lowered.match_indices(kw).any(|(start, _)| {
        let before = lowered[..start].chars().next_back();
        let after = lowered[start + kw.len()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
        let kw_first = kw.chars().next().map_or(false, |c| c.is_alphanumeric());
        let kw_last = kw.chars().next_back().map_or(false, |c| c.is_alphanumeric());
        (!kw_first || boundary(before)) && (!kw_last || boundary(after))
    })
}
