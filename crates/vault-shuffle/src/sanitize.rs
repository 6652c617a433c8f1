// Provider error text ends up in logs and in the checkpoint file, so it is
// reduced to a single printable line first.

const MAX_MESSAGE_CHARS: usize = 1024;

pub fn clean_message(input: &str) -> String {
    clean_message_with_limit(input, MAX_MESSAGE_CHARS)
}

pub fn clean_message_with_limit(input: &str, limit: usize) -> String {
    let stripped = strip_escapes(input);
    let mut out = String::with_capacity(stripped.len().min(limit));
    let mut last_space = true;
    let mut count = 0usize;

    for c in stripped.chars() {
        let c = if c.is_whitespace() { ' ' } else { c };
        if c == ' ' {
            if last_space {
                continue;
            }
            last_space = true;
        } else if c.is_control() || is_bidi_control(c) {
            continue;
        } else {
            last_space = false;
        }
        if count == limit {
            let trimmed = out.trim_end().to_string();
            return format!("{trimmed} ...[truncated]");
        }
        out.push(c);
        count += 1;
    }

    out.trim_end().to_string()
}

// Drops CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ESC \`) sequences;
// any other escape swallows the following character.
fn strip_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('[') => {
                for n in chars.by_ref() {
                    if ('@'..='~').contains(&n) {
                        break;
                    }
                }
            }
            Some(']') => {
                while let Some(n) = chars.next() {
                    if n == '\x07' {
                        break;
                    }
                    if n == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_multiline_cli_errors() {
        let input = "\nAn error occurred (ThrottlingException) when calling the\n  ListBackupVaults operation: Rate exceeded\n";
        assert_eq!(
            clean_message(input),
            "An error occurred (ThrottlingException) when calling the ListBackupVaults operation: Rate exceeded"
        );
    }

    #[test]
    fn strips_color_and_title_sequences() {
        let input = "\u{1b}[31merror\u{1b}[0m: \u{1b}]0;title\u{7}denied";
        assert_eq!(clean_message(input), "error: denied");
    }

    #[test]
    fn drops_bidi_controls_and_truncates() {
        assert_eq!(clean_message("a\u{202e}b"), "ab");
        let long = "x".repeat(20);
        assert_eq!(clean_message_with_limit(&long, 5), "xxxxx ...[truncated]");
    }
}
