//! Rendering bullets for prompts, and phrasing translation for promotion.

use playbook_core::{Bullet, BulletKind};
use regex::Regex;
use std::sync::OnceLock;

const SECTIONS: &[(&str, &[BulletKind])] = &[
    ("TOOL RULES (API/Tool Usage)", &[BulletKind::ToolRule]),
    ("BEST PRACTICES", &[BulletKind::Heuristic, BulletKind::Strategy]),
    ("PROCEDURES", &[BulletKind::Checklist]),
    ("COMMON PITFALLS (Avoid These)", &[BulletKind::Pitfall]),
    ("KNOWN PATTERNS", &[BulletKind::Pattern]),
    ("EXAMPLES", &[BulletKind::Example]),
    ("TEMPLATES", &[BulletKind::Template]),
    ("KEY CONCEPTS", &[BulletKind::Concept]),
    ("OTHER", &[BulletKind::Question]),
];

/// Group bullets under kind headings, in a fixed section order. Input order
/// is kept within a section.
pub fn format_bullets_for_prompt(bullets: &[Bullet]) -> String {
    let mut sections = Vec::new();
    for (heading, kinds) in SECTIONS {
        let lines: Vec<String> = bullets
            .iter()
            .filter(|b| kinds.contains(&b.kind))
            .map(|b| {
                let marker = if b.kind == BulletKind::Pitfall { "!" } else { "-" };
                format!("  {marker} {}", b.text)
            })
            .collect();
        if !lines.is_empty() {
            sections.push(format!("{heading}:\n{}\n", lines.join("\n")));
        }
    }
    sections.join("\n")
}

/// Numbered single list, capped at `max`.
pub fn format_bullets_compact(bullets: &[Bullet], max: usize) -> String {
    let mut lines: Vec<String> = bullets
        .iter()
        .take(max)
        .enumerate()
        .map(|(i, b)| format!("{}. [{}] {}", i + 1, b.kind, b.text))
        .collect();
    if bullets.len() > max {
        lines.push(format!("... and {} more", bullets.len() - max));
    }
    lines.join("\n")
}

fn rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)\bmust not\b", "avoid"),
            (r"(?i)\bdo not\b", "avoid"),
            (r"(?i)\bnever\b", "avoid"),
            (r"(?i)\bmust\b", "should"),
            (r"(?i)\balways\b", "usually"),
            (r"(?i)\brequired\b", "recommended"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    })
}

/// Soften absolute phrasing so a rule reads as guidance in the shared group.
pub fn translate_for_shared(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in rules() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_core::{BulletStatus, Group};

    fn b(kind: BulletKind, text: &str) -> Bullet {
        Bullet::new(text, Group::Shared, kind, vec![], 0.8, BulletStatus::Active)
    }

    #[test]
    fn sections_follow_fixed_order() {
        let out = format_bullets_for_prompt(&[
            b(BulletKind::Pitfall, "Do not retry POSTs blindly"),
            b(BulletKind::ToolRule, "Pass --json to the CLI"),
            b(BulletKind::Strategy, "Cache lookups"),
        ]);
        let tools = out.find("TOOL RULES").unwrap();
        let practices = out.find("BEST PRACTICES").unwrap();
        let pitfalls = out.find("COMMON PITFALLS").unwrap();
        assert!(tools < practices && practices < pitfalls);
        assert!(out.contains("  ! Do not retry POSTs blindly"));
        assert!(!out.contains("TEMPLATES"));
    }

    #[test]
    fn empty_input_renders_nothing() {
        assert_eq!(format_bullets_for_prompt(&[]), "");
        assert_eq!(format_bullets_compact(&[], 5), "");
    }

    #[test]
    fn compact_reports_overflow() {
        let bullets: Vec<Bullet> = (0..4).map(|i| b(BulletKind::Example, &format!("example {i}"))).collect();
        let out = format_bullets_compact(&bullets, 2);
        assert!(out.starts_with("1. [example] example 0"));
        assert!(out.ends_with("... and 2 more"));
    }

    #[test]
    fn translation_softens_absolutes() {
        assert_eq!(
            translate_for_shared("You must not skip auth. Always log. Never guess. A token is required."),
            "You avoid skip auth. usually log. avoid guess. A token is recommended."
        );
        assert_eq!(translate_for_shared("Mustard is fine"), "Mustard is fine");
    }
}
