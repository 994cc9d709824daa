//! Canonical key-alias normalization shared by every handler (§4.3).

fn canonical_for(alias: &str) -> Option<&'static str> {
    const ALIASES: &[(&str, &[&str])] = &[
        ("Escape", &["esc", "escape"]),
        ("Return", &["enter", "return"]),
        ("BackSpace", &["backspace", "bksp"]),
        ("Delete", &["del", "delete"]),
        ("Tab", &["tab"]),
        ("space", &["space", "spacebar"]),
        ("Page_Up", &["pageup", "pgup"]),
        ("Page_Down", &["pagedown", "pgdn"]),
        ("Home", &["home"]),
        ("End", &["end"]),
        ("Up", &["up", "uparrow"]),
        ("Down", &["down", "downarrow"]),
        ("Left", &["left", "leftarrow"]),
        ("Right", &["right", "rightarrow"]),
        ("Print", &["printscreen", "prtsc", "prtscrn"]),
        ("Insert", &["ins", "insert"]),
        ("Pause", &["pause", "pausebreak"]),
        ("ScrollLock", &["scrolllock", "scroll"]),
        ("CapsLock", &["capslock", "caps"]),
        ("NumLock", &["numlock", "num"]),
        ("Super_L", &["win", "windows", "super", "meta", "cmd", "super_l", "super_r"]),
        ("ctrl", &["ctrl", "control", "ctrl_l", "ctrl_r"]),
        ("shift", &["shift", "shift_l", "shift_r"]),
        ("alt", &["alt", "alt_l", "alt_r", "option"]),
    ];

    let lower = alias.to_lowercase();
    ALIASES.iter().find(|(_, aliases)| aliases.contains(&lower.as_str())).map(|(canonical, _)| *canonical)
}

fn normalize_key_part(part: &str) -> String {
    if let Some(canonical) = canonical_for(part) {
        return canonical.to_string();
    }

    let lower = part.to_lowercase();
    if let Some(digits) = lower.strip_prefix('f') {
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = digits.parse::<u32>() {
                return format!("F{n}");
            }
        }
    }

    if part.chars().count() == 1 {
        return part.to_string();
    }

    part.to_string()
}

/// `"ctrl + c"` -> `"ctrl+c"`, `"Win"` -> `"Super_L"`, idempotent per §8.
pub fn normalize_key_combo(combo: &str) -> String {
    combo
        .replace(' ', "")
        .split('+')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_key_part)
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_aliases() {
        assert_eq!(normalize_key_combo("esc"), "Escape");
        assert_eq!(normalize_key_combo("cmd"), "Super_L");
        assert_eq!(normalize_key_combo("win"), "Super_L");
        assert_eq!(normalize_key_combo("ctrl + c"), "ctrl+c");
        assert_eq!(normalize_key_combo("F5"), "F5");
        assert_eq!(normalize_key_combo("f12"), "F12");
    }

    #[test]
    fn is_idempotent() {
        for combo in ["ctrl + shift + esc", "alt+F4", "win", "a"] {
            let once = normalize_key_combo(combo);
            let twice = normalize_key_combo(&once);
            assert_eq!(once, twice, "not idempotent for {combo}");
        }
    }

    #[test]
    fn single_characters_pass_through() {
        assert_eq!(normalize_key_combo("a"), "a");
        assert_eq!(normalize_key_combo("9"), "9");
    }
}
