//! Parsing of the colored tabular output the interactive shell prints.
//!
//! Every value the shell prints is wrapped in an ANSI color sequence. Static
//! tables print a header line of column names and then one colored value per
//! `|`-separated slot; dynamic tables print one line per row where each slot
//! holds a colored column name followed by a colored value.

use crate::comparison::{ShellCell, ShellRow};
use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;

/// A single colored value
static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[(?:\d;\d;\d\dm|\d;\d\dm)(.*?)\x1b\[0m").expect("valid value pattern")
});

/// A bold red banner, used by the shell for errors
static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[0;1;31m(.*?)\x1b\[0m").expect("valid error pattern"));

static SLOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^|]+").expect("valid slot pattern"));

/// Banner printed when the server did not answer in time
pub const TIMEOUT_BANNER: &str = r"\x1b\[0;1;\d\dmRequest did not complete within rpc_timeout\.\x1b\[0m";

/// Printed by the shell when `USE` names a missing keyspace
pub const MISSING_KEYSPACE: &str = "Bad Request: Keyspace";

/// Every colored value in `text`, in order
pub fn colored_values(text: &str) -> Vec<&str> {
    VALUE_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// The message of the first error banner in `text`, if any
pub fn error_banner(text: &str) -> Option<&str> {
    ERROR_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Lines that carry values: anything colored or containing the delimiter
pub fn output_lines(text: &str) -> Result<Vec<&str>> {
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| VALUE_RE.is_match(line) || line.contains('|'))
        .collect();
    if let Some(message) = lines.first().and_then(|line| error_banner(line)) {
        return Err(Error::ShellError(message.to_string()));
    }
    Ok(lines)
}

fn slots(line: &str) -> impl Iterator<Item = &str> {
    SLOT_RE
        .find_iter(line)
        .map(|m| m.as_str())
        .filter(|slot| !slot.trim().is_empty())
}

/// Parse the output of a select on a static table
pub fn parse_static(text: &str) -> Result<Vec<ShellRow>> {
    let lines = output_lines(text)?;
    let Some((header, rows)) = lines.split_first() else {
        return Ok(Vec::new());
    };
    let names = colored_values(header);

    rows.iter()
        .map(|line| {
            slots(line)
                .enumerate()
                .map(|(slot_id, slot)| {
                    let found = colored_values(slot);
                    if found.len() != 1 {
                        return Err(Error::ShellOutputShape {
                            expected: 1,
                            found: found.len(),
                            line: line.to_string(),
                        });
                    }
                    let name = names.get(slot_id).ok_or_else(|| Error::ShellOutputShape {
                        expected: names.len(),
                        found: slot_id + 1,
                        line: line.to_string(),
                    })?;
                    Ok(ShellCell::new(*name, found[0]))
                })
                .collect::<Result<ShellRow>>()
        })
        .collect()
}

/// Parse the output of a select on a dynamic table
pub fn parse_dynamic(text: &str) -> Result<Vec<ShellRow>> {
    output_lines(text)?
        .into_iter()
        .map(|line| {
            slots(line)
                .map(|slot| match colored_values(slot).as_slice() {
                    [name, value] => Ok(ShellCell::new(*name, *value)),
                    other => Err(Error::ShellOutputShape {
                        expected: 2,
                        found: other.len(),
                        line: line.to_string(),
                    }),
                })
                .collect::<Result<ShellRow>>()
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Color a value the way the shell does
    pub(crate) fn paint(value: &str) -> String {
        format!("\x1b[1;33m{value}\x1b[0m")
    }

    pub(crate) fn paint_name(value: &str) -> String {
        format!("\x1b[0;1;35m{value}\x1b[0m")
    }

    #[test]
    fn test_colored_values() {
        let line = format!("{} | {}", paint("a"), paint_name("b"));
        assert_eq!(colored_values(&line), ["a", "b"]);
        assert!(colored_values("plain text").is_empty());
    }

    #[test]
    fn test_parse_static() {
        let text = format!(
            "SELECT * FROM cf;\n {} | {}\n {} | {}\n {} | {}\ncqlsh:ks> ",
            paint_name("KEY"),
            paint_name("col_0_text"),
            paint("k0"),
            paint("v0"),
            paint("k1"),
            paint("v1"),
        );
        let rows = parse_static(&text).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![ShellCell::new("KEY", "k0"), ShellCell::new("col_0_text", "v0")],
                vec![ShellCell::new("KEY", "k1"), ShellCell::new("col_0_text", "v1")],
            ]
        );
    }

    #[test]
    fn test_static_slot_with_two_values_is_fatal() {
        let text = format!(
            "{} | {}\n{} | {}{}\n",
            paint_name("KEY"),
            paint_name("c"),
            paint("k"),
            paint("x"),
            paint("y"),
        );
        assert!(matches!(
            parse_static(&text),
            Err(Error::ShellOutputShape { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn test_parse_dynamic() {
        let text = format!(
            "{},{} | {},{}\n",
            paint_name("KEY"),
            paint("k0"),
            paint_name("col_name0_0"),
            paint("value0_0"),
        );
        let rows = parse_dynamic(&text).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                ShellCell::new("KEY", "k0"),
                ShellCell::new("col_name0_0", "value0_0")
            ]]
        );
    }

    #[test]
    fn test_dynamic_slot_needs_name_and_value() {
        let text = format!("{} | {}\n", paint("k0"), paint("v"));
        assert!(matches!(
            parse_dynamic(&text),
            Err(Error::ShellOutputShape { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_error_banner_is_surfaced() {
        let text = "\x1b[0;1;31mcannot concatenate 'str' and 'int' objects\x1b[0m\n";
        assert!(matches!(
            parse_dynamic(text),
            Err(Error::ShellError(m)) if m.starts_with("cannot concatenate")
        ));
    }

    #[test]
    fn test_timeout_banner_pattern() {
        let re = Regex::new(TIMEOUT_BANNER).unwrap();
        assert!(re.is_match("\x1b[0;1;31mRequest did not complete within rpc_timeout.\x1b[0m"));
        assert!(!re.is_match("Request did not complete"));
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_static("cqlsh> ").unwrap().is_empty());
        assert!(parse_dynamic("").unwrap().is_empty());
    }
}
