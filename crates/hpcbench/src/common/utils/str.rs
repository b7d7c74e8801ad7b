use std::borrow::Cow;

/// Return the input string with an added "s" at the end if `count` is not one.
pub fn pluralize(value: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value}s"))
    }
}

/// Quotes a value for a POSIX shell command line.
/// Values that consist only of safe characters are returned unchanged.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c);
    if !value.is_empty() && value.chars().all(is_safe) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

#[cfg(test)]
mod tests {
    use super::{pluralize, shell_quote};

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("job", 1), "job");
        assert_eq!(pluralize("job", 0), "jobs");
        assert_eq!(pluralize("job", 3), "jobs");
    }

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("/tmp/x.sh"), "/tmp/x.sh");
        assert_eq!(shell_quote("mel2001:9090"), "mel2001:9090");
    }

    #[test]
    fn test_shell_quote_special() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }
}
