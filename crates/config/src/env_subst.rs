/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in raw
/// config text.
///
/// Unresolvable variables without a fallback are left as-is so that the
/// parse error (or the literal value) points at the missing variable.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with a custom lookup, so tests never touch
/// the process environment.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder, emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (is_var_name(name), lookup(name), fallback) {
            (true, Some(value), _) if !value.is_empty() || fallback.is_none() => {
                out.push_str(&value);
            },
            (true, _, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "SB_TOKEN" => Some("abc123".into()),
            "SB_EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[rstest]
    #[case("token = \"${SB_TOKEN}\"", "token = \"abc123\"")]
    #[case("${SB_MISSING}", "${SB_MISSING}")]
    #[case("${SB_MISSING:-fallback}", "fallback")]
    #[case("${SB_EMPTY:-fallback}", "fallback")]
    #[case("${SB_EMPTY}", "")]
    #[case("${not a var}", "${not a var}")]
    #[case("tail ${SB_TOKEN", "tail ${SB_TOKEN")]
    #[case("plain text", "plain text")]
    #[case("a=${SB_TOKEN} b=${SB_TOKEN}", "a=abc123 b=abc123")]
    fn substitution(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(substitute_env_with(input, lookup), expected);
    }
}
