/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! Console output of the two binaries. Stdout carries results only (the CNI
//! runtime parses it); diagnostics go to stderr and are coloured only when
//! stderr is a terminal.

use std::fmt;
use std::io::{self, IsTerminal, Write};

const COLOR_ERROR: &str = "\x1b[31m";
const COLOR_WARN: &str = "\x1b[33m";
const COLOR_RESET: &str = "\x1b[0m";

pub struct Terminal;

impl Terminal {
    pub fn stdout(args: fmt::Arguments<'_>) {
        let _ = writeln!(io::stdout().lock(), "{args}");
    }

    pub fn warn(args: fmt::Arguments<'_>) {
        Self::diagnostic(COLOR_WARN, args);
    }

    pub fn error(args: fmt::Arguments<'_>) {
        Self::diagnostic(COLOR_ERROR, args);
    }

    fn diagnostic(color: &str, args: fmt::Arguments<'_>) {
        let mut handle = io::stderr().lock();
        let line = paint(color, args, handle.is_terminal());
        let _ = writeln!(handle, "{line}");
    }
}

fn paint(color: &str, args: fmt::Arguments<'_>, colored: bool) -> String {
    if colored {
        format!("{color}{args}{COLOR_RESET}")
    } else {
        args.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_are_plain_when_not_a_terminal() {
        assert_eq!(paint(COLOR_WARN, format_args!("skipped {}", "bogus"), false), "skipped bogus");
        assert_eq!(
            paint(COLOR_ERROR, format_args!("Error: boom"), true),
            "\x1b[31mError: boom\x1b[0m"
        );
    }
}
