use atty::Stream;
use colored::{ColoredString, Colorize};

// Code-like spans in diagnostics: task names, runner names, glob patterns, template text. On a
// terminal they are colored; elsewhere they are backquoted so piped log output stays readable.
pub trait CodeStr {
    fn code_str(&self) -> ColoredString;
}

impl CodeStr for str {
    fn code_str(&self) -> ColoredString {
        if atty::is(Stream::Stdout) {
            self.cyan()
        } else {
            format!("`{}`", self).as_str().into()
        }
    }
}

// Join already-formatted names for a diagnostic, e.g. the named outputs a dependency actually
// declares. An empty list renders as "(none)" so a message never trails off into nothing.
pub fn name_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_owned()
    } else {
        items.join(", ")
    }
}
