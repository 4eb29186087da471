/// Removes non-speech markers the recognizer emits for silence or noise
/// (`[BLANK_AUDIO]`, `[MUSIC]`, ...) and collapses whitespace.
pub fn sanitize_user_transcript(input: &str) -> String {
    let without_artifacts = strip_bracket_artifacts(input);
    let without_cues = strip_paren_cues(&without_artifacts);
    normalize_whitespace(&without_cues)
}

/// True when nothing a command could be parsed from survives sanitization.
pub fn is_silent_transcript(input: &str) -> bool {
    sanitize_user_transcript(input)
        .chars()
        .all(|ch| !ch.is_alphanumeric())
}

fn strip_bracket_artifacts(input: &str) -> String {
    strip_delimited(input, '[', ']')
}

// Spanish recognizers mark non-speech as "(musica)" or "(silencio)".
fn strip_paren_cues(input: &str) -> String {
    strip_delimited(input, '(', ')')
}

fn strip_delimited(input: &str, open: char, close: char) -> String {
    let chars = input.chars().collect::<Vec<_>>();
    let mut output = String::with_capacity(input.len());
    let mut idx = 0usize;

    while idx < chars.len() {
        if chars[idx] == open {
            let mut end = idx + 1;
            while end < chars.len() && chars[end] != close {
                end += 1;
            }

            if end < chars.len() {
                let token = chars[idx + 1..end].iter().collect::<String>();
                let is_artifact = if open == '[' {
                    is_artifact_token(&token)
                } else {
                    is_sound_cue(&token)
                };
                if is_artifact {
                    idx = end + 1;
                    continue;
                }
            }
        }

        output.push(chars[idx]);
        idx += 1;
    }

    output
}

fn is_artifact_token(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 48 {
        return false;
    }

    let mut saw_ascii_alpha = false;
    for ch in trimmed.chars() {
        if ch.is_ascii_alphabetic() {
            if ch.is_ascii_lowercase() {
                return false;
            }
            saw_ascii_alpha = true;
            continue;
        }

        if ch.is_ascii_digit() || ch == '_' || ch == '-' || ch == ' ' {
            continue;
        }

        return false;
    }

    saw_ascii_alpha
}

fn is_sound_cue(value: &str) -> bool {
    const CUES: [&str; 8] = [
        "musica", "música", "silencio", "ruido", "risas", "aplausos", "music", "silence",
    ];
    let lowered = value.trim().to_lowercase();
    CUES.contains(&lowered.as_str())
}

fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
