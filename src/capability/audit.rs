//! Entrypoint audit for the portable sandbox.
//!
//! Lexes the entrypoint the way a POSIX shell would (quotes, escapes,
//! comments, redirections, separators, command substitution) and lists every
//! filesystem access it can see, classified by mode. The result is checked
//! against the node's grants before anything is spawned.
//!
//! The audit follows the working directory across `cd` and the variables
//! the command line assigns. A target whose value only exists at run time
//! (the output of a substitution, a variable bound by `read` or `for`, an
//! inline interpreter program, arguments fed through `xargs`) is reported
//! as unresolved, and the guard denies every unresolved access.
//!
//! Programs that compute paths internally are out of its reach. The native
//! backend closes that gap in the kernel.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::AccessMode;
use crate::descriptor::is_identifier;

const MAX_DEPTH: usize = 8;

/// Stand-ins for `$` and `~` that were quoted or escaped, so expansion
/// leaves them alone.
const LITERAL_DOLLAR: char = '\u{f8f0}';
const LITERAL_TILDE: char = '\u{f8f1}';

/// Programs whose path operands are all written to.
const MUTATING_PROGRAMS: &[&str] = &[
    "touch", "rm", "rmdir", "mkdir", "tee", "truncate", "chmod", "chown", "chgrp", "shred",
    "unlink", "mkfifo", "mv",
];

/// Programs whose last path operand is written to and the others read.
const COPYING_PROGRAMS: &[&str] = &["cp", "ln", "install", "rsync"];

/// Shells whose `-c` argument is itself audited.
const SHELLS: &[&str] = &["sh", "bash", "dash", "zsh", "ksh"];

/// Keywords that may precede the program word of a command.
const PREFIX_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "!", "{", "}", "exec",
    "command", "time", "nohup", "env",
];

/// Builtins and utilities that never take a path operand.
const PATHLESS_PROGRAMS: &[&str] = &[
    "echo", "printf", "true", "false", ":", "sleep", "seq", "expr", "exit", "return", "shift",
    "set", "unset", "wait", "kill", "read", "getopts",
];

/// Builtins whose operands are `NAME=value` assignments.
const DECLARATION_PROGRAMS: &[&str] = &["export", "local", "readonly", "declare", "typeset"];

/// Variables the shell itself maintains.
const RUNTIME_VARIABLES: &[&str] = &[
    "PWD", "OLDPWD", "REPLY", "OPTARG", "OPTIND", "RANDOM", "PPID", "LINENO", "SECONDS",
];

/// A filesystem access the entrypoint would perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    /// Path after expansion (may be relative to the sandbox root), or the
    /// raw word when the target is unresolved.
    pub path: String,
    pub mode: AccessMode,
    /// Why the target cannot be known before the command runs.
    pub unresolved: Option<&'static str>,
}

impl Access {
    fn resolved(path: String, mode: AccessMode) -> Self {
        Self {
            path,
            mode,
            unresolved: None,
        }
    }

    fn unresolved(word: &str, mode: AccessMode, reason: &'static str) -> Self {
        Self {
            path: restore_literals(word),
            mode,
            unresolved: Some(reason),
        }
    }
}

/// Lexing failure: the entrypoint is not a well-formed shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError(pub String);

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Word {
    text: String,
    /// Contains a `$(...)` or backtick substitution.
    substituted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(Word),
    Redirect(Redirect),
    Separator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redirect {
    In,
    Out,
    Append,
    ReadWrite,
    /// `>&` / `<&`: duplicates a descriptor unless the target is a word.
    Dup,
    /// `<<`: the following word is a delimiter, not a path.
    HereDoc,
}

/// Body of a `$(...)` or backtick substitution, and the index of the word
/// token it belongs to.
#[derive(Debug)]
struct Substitution {
    at: usize,
    body: String,
}

/// Checks that the entrypoint lexes as a shell command.
pub fn validate(entrypoint: &str) -> Result<(), LexError> {
    lex(entrypoint).map(|_| ())
}

/// Lists the filesystem accesses in `entrypoint`, expanding `$VAR` and `~`
/// against `env`. Unknown variables expand to the empty string, as they
/// will when the command runs with that environment.
pub fn scan(entrypoint: &str, env: &BTreeMap<String, String>) -> Result<Vec<Access>, LexError> {
    let mut accesses = Vec::new();
    Shell::new(env).scan(entrypoint, &mut accesses)?;
    Ok(accesses)
}

/// What the audit knows about the shell state at a point in the command line.
#[derive(Debug, Clone)]
struct Shell<'e> {
    env: &'e BTreeMap<String, String>,
    /// Variables assigned a literal value earlier in the command line.
    assigned: BTreeMap<String, String>,
    /// Variables bound to values that only exist at run time.
    dynamic: BTreeSet<String>,
    /// Working directory after the last `cd`; `None` is the sandbox root.
    cwd: Option<String>,
    depth: usize,
}

impl<'e> Shell<'e> {
    fn new(env: &'e BTreeMap<String, String>) -> Self {
        Self {
            env,
            assigned: BTreeMap::new(),
            dynamic: BTreeSet::new(),
            cwd: None,
            depth: 0,
        }
    }

    fn scan(&mut self, line: &str, out: &mut Vec<Access>) -> Result<(), LexError> {
        if self.depth > MAX_DEPTH {
            return Err(LexError("command nesting too deep to audit".to_string()));
        }
        let (tokens, substitutions) = lex(line)?;

        let ends: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t, Token::Separator))
            .map(|(i, _)| i)
            .chain(std::iter::once(tokens.len()))
            .collect();

        let mut start = 0;
        for end in ends {
            // A substitution runs in a subshell before its command
            for sub in substitutions.iter().filter(|s| (start..end).contains(&s.at)) {
                self.subshell().scan(&sub.body, out)?;
            }
            self.scan_command(&tokens[start..end], out)?;
            start = end + 1;
        }
        Ok(())
    }

    fn subshell(&self) -> Shell<'e> {
        let mut shell = self.clone();
        shell.depth += 1;
        shell
    }

    /// Scans `line` in this shell, as `eval` does.
    fn scan_inline(&mut self, line: &str, out: &mut Vec<Access>) -> Result<(), LexError> {
        self.depth += 1;
        let result = self.scan(line, out);
        self.depth -= 1;
        result
    }

    fn scan_command(&mut self, tokens: &[Token], out: &mut Vec<Access>) -> Result<(), LexError> {
        let mut program: Option<&Word> = None;
        let mut operands: Vec<&Word> = Vec::new();
        let mut assignments: Vec<&Word> = Vec::new();
        let mut iter = tokens.iter().peekable();

        while let Some(token) = iter.next() {
            match token {
                Token::Redirect(op) => {
                    let Some(Token::Word(target)) = iter.peek().copied() else {
                        continue;
                    };
                    iter.next();
                    let mode = match op {
                        Redirect::In => Some(AccessMode::Read),
                        Redirect::Out | Redirect::Append | Redirect::ReadWrite => Some(AccessMode::Write),
                        Redirect::Dup if !target.substituted && is_fd_target(&target.text) => None,
                        Redirect::Dup => Some(AccessMode::Write),
                        Redirect::HereDoc => None,
                    };
                    if let Some(mode) = mode {
                        self.access(target, mode, "redirection target is only known at run time", out);
                    }
                }
                Token::Word(word) if program.is_none() => {
                    if is_assignment(&word.text) {
                        assignments.push(word);
                    } else if !PREFIX_KEYWORDS.contains(&word.text.as_str()) {
                        program = Some(word);
                    }
                }
                Token::Word(word) => operands.push(word),
                Token::Separator => {}
            }
        }

        for word in &assignments {
            let value = self.assign(word, out);
            // `NAME=value cmd` only reaches the command's environment
            if program.is_none() {
                self.bind(assigned_name(word), value);
            }
        }

        let Some(program) = program else {
            return Ok(());
        };
        let Some(program_text) = self.expand(program) else {
            out.push(Access::unresolved(
                &program.text,
                AccessMode::Execute,
                "program is only known at run time",
            ));
            return Ok(());
        };
        if is_path_like(&program_text) {
            self.push(program_text.clone(), AccessMode::Execute, out);
        }
        let name = if program_text == "." {
            program_text.clone()
        } else {
            Path::new(&program_text)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        match name.as_str() {
            "cd" | "pushd" => {
                self.change_dir(&operands, out);
                return Ok(());
            }
            "popd" => {
                out.push(Access::unresolved(
                    "popd",
                    AccessMode::Read,
                    "directory stack is only known at run time",
                ));
                return Ok(());
            }
            "eval" => {
                if let Some(word) = operands.iter().find(|w| w.substituted) {
                    out.push(Access::unresolved(
                        &word.text,
                        AccessMode::Execute,
                        "evaluated command is only known at run time",
                    ));
                    return Ok(());
                }
                let line = operands
                    .iter()
                    .map(|w| restore_literals(&w.text))
                    .collect::<Vec<_>>()
                    .join(" ");
                return self.scan_inline(&line, out);
            }
            "xargs" => {
                out.push(Access::unresolved(
                    "xargs",
                    AccessMode::Write,
                    "arguments come from standard input",
                ));
                return Ok(());
            }
            "source" | "." => {
                let script = operands.first().map(|w| w.text.as_str()).unwrap_or(".");
                out.push(Access::unresolved(
                    script,
                    AccessMode::Execute,
                    "sourced script is not audited",
                ));
                return Ok(());
            }
            "read" => {
                for word in operands.iter().filter(|w| is_identifier(&w.text)) {
                    self.bind(&word.text, None);
                }
            }
            "getopts" => {
                if let Some(word) = operands.get(1) {
                    self.bind(&word.text, None);
                }
            }
            "for" | "select" => {
                if let Some(word) = operands.first() {
                    self.bind(&word.text, None);
                }
                for word in operands.iter().skip(1).filter(|w| w.text != "in") {
                    self.operand(word, AccessMode::Read, out);
                }
                return Ok(());
            }
            _ => {}
        }

        if SHELLS.contains(&name.as_str()) {
            return self.scan_shell(&operands, out);
        }
        if let Some(pos) = operands
            .iter()
            .position(|w| is_inline_program_flag(&name, &w.text))
        {
            let code = operands.get(pos + 1).copied().unwrap_or(operands[pos]);
            out.push(Access::unresolved(
                &code.text,
                AccessMode::Execute,
                "inline program can reach any path",
            ));
            return Ok(());
        }
        if DECLARATION_PROGRAMS.contains(&name.as_str()) {
            for word in operands.iter().filter(|w| is_assignment(&w.text)) {
                let value = self.assign(word, out);
                self.bind(assigned_name(word), value);
            }
            return Ok(());
        }
        if PATHLESS_PROGRAMS.contains(&name.as_str()) {
            return Ok(());
        }

        let writes_all = MUTATING_PROGRAMS.contains(&name.as_str()) || writes_operands(&name, &operands);
        let copying = COPYING_PROGRAMS.contains(&name.as_str());
        let paths: Vec<&Word> = operands
            .iter()
            .copied()
            .filter(|w| !w.text.starts_with('-') || w.text.contains('='))
            .collect();

        for (i, word) in paths.iter().enumerate() {
            let mode = if writes_all || (copying && i + 1 == paths.len()) {
                AccessMode::Write
            } else {
                AccessMode::Read
            };
            self.operand(word, mode, out);
        }
        Ok(())
    }

    /// `sh -c 'script' [args]`, `sh file`, or a shell reading standard input.
    fn scan_shell(&mut self, operands: &[&Word], out: &mut Vec<Access>) -> Result<(), LexError> {
        let command_flag = operands.iter().position(|w| {
            w.text.starts_with('-') && !w.text.starts_with("--") && w.text.contains('c')
        });
        match command_flag {
            Some(pos) => {
                let Some(script) = operands.get(pos + 1) else {
                    return Ok(());
                };
                // Anything after the script becomes its positional parameters
                for word in &operands[pos + 2..] {
                    self.operand(word, AccessMode::Read, out);
                }
                if script.substituted {
                    out.push(Access::unresolved(
                        &script.text,
                        AccessMode::Execute,
                        "shell script is only known at run time",
                    ));
                    return Ok(());
                }
                self.subshell().scan(&restore_literals(&script.text), out)
            }
            None => {
                let files: Vec<&&Word> = operands.iter().filter(|w| !w.text.starts_with('-')).collect();
                if files.is_empty() {
                    out.push(Access::unresolved(
                        "-",
                        AccessMode::Execute,
                        "commands come from standard input",
                    ));
                }
                // The script runs like a program; the rest are its arguments
                for (i, word) in files.into_iter().enumerate() {
                    let mode = if i == 0 { AccessMode::Execute } else { AccessMode::Read };
                    self.operand(word, mode, out);
                }
                Ok(())
            }
        }
    }

    fn change_dir(&mut self, operands: &[&Word], out: &mut Vec<Access>) {
        let target = operands
            .iter()
            .find(|w| !w.text.starts_with('-') || w.text == "-");
        let dir = match target {
            None => Some(self.lookup("HOME").to_string()),
            Some(word) if word.text == "-" => None,
            Some(word) => self.expand(word),
        };
        let Some(dir) = dir else {
            let word = target.map(|w| w.text.as_str()).unwrap_or("-");
            out.push(Access::unresolved(
                word,
                AccessMode::Read,
                "working directory is only known at run time",
            ));
            return;
        };
        let dir = self.locate(dir);
        out.push(Access::resolved(dir.clone(), AccessMode::Read));
        self.cwd = Some(dir);
    }

    /// Records the read a path-like assignment value implies and returns
    /// the value, or `None` when it is only known at run time.
    fn assign(&self, word: &Word, out: &mut Vec<Access>) -> Option<String> {
        let (_, value) = word.text.split_once('=')?;
        let value = self.expand(&Word {
            text: value.to_string(),
            substituted: word.substituted,
        })?;
        if is_path_like(&value) {
            self.push(value.clone(), AccessMode::Read, out);
        }
        Some(value)
    }

    /// Binds `name` to `value`, or marks it as only known at run time.
    fn bind(&mut self, name: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.dynamic.remove(name);
                self.assigned.insert(name.to_string(), value);
            }
            None => {
                self.assigned.remove(name);
                self.dynamic.insert(name.to_string());
            }
        }
    }

    /// Audits one program operand.
    fn operand(&self, word: &Word, mode: AccessMode, out: &mut Vec<Access>) {
        let Some(text) = self.expand(word) else {
            out.push(Access::unresolved(
                &word.text,
                mode,
                "argument is only known at run time",
            ));
            return;
        };
        // `dd if=/x of=/y`, `--output=/y`
        if let Some((key, value)) = text.split_once('=') {
            if self.is_path_candidate(value) {
                let mode = if key == "of" || key.ends_with("output") {
                    AccessMode::Write
                } else {
                    mode
                };
                self.push(value.to_string(), mode, out);
            }
            return;
        }
        if self.is_path_candidate(&text) {
            self.push(text, mode, out);
        }
    }

    fn access(&self, word: &Word, mode: AccessMode, reason: &'static str, out: &mut Vec<Access>) {
        match self.expand(word) {
            Some(path) => self.push(path, mode, out),
            None => out.push(Access::unresolved(&word.text, mode, reason)),
        }
    }

    fn push(&self, path: String, mode: AccessMode, out: &mut Vec<Access>) {
        out.push(Access::resolved(self.locate(path), mode));
    }

    /// Anchors a relative path at the current working directory.
    fn locate(&self, path: String) -> String {
        match self.cwd {
            Some(ref cwd) if !cwd.is_empty() && !path.starts_with('/') => {
                format!("{}/{path}", cwd.trim_end_matches('/'))
            }
            _ => path,
        }
    }

    fn is_path_candidate(&self, word: &str) -> bool {
        // Past a `cd`, bare names may point outside the sandbox root
        is_path_like(word) || (self.cwd.is_some() && !word.is_empty())
    }

    /// Expands `word`, or returns `None` when its value only exists at run time.
    fn expand(&self, word: &Word) -> Option<String> {
        if word.substituted || references(&word.text).into_iter().any(|n| self.is_dynamic(n)) {
            return None;
        }
        let home = self
            .assigned
            .get("HOME")
            .or_else(|| self.env.get("HOME"))
            .map(String::as_str);
        let expanded = shellexpand::full_with_context_no_errors(
            &word.text,
            || home,
            |name| Some(self.lookup(name)),
        );
        Some(restore_literals(&expanded))
    }

    fn lookup<'s>(&'s self, name: &str) -> &'s str {
        self.assigned
            .get(name)
            .or_else(|| self.env.get(name))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn is_dynamic(&self, name: &str) -> bool {
        self.dynamic.contains(name) || RUNTIME_VARIABLES.contains(&name) || !is_identifier(name)
    }
}

/// Names of the parameters `word` expands: `$NAME`, `${NAME...}`, `$1`, `$@`.
fn references(word: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = word;
    while let Some(pos) = rest.find('$') {
        let after = &rest[pos + 1..];
        let body = match after.strip_prefix('{') {
            Some(braced) => braced.trim_start_matches(|c: char| c == '#' || c == '!'),
            None => after,
        };
        let len = match body.chars().next() {
            Some(c) if c == '_' || c.is_ascii_alphabetic() => body
                .find(|c: char| !(c == '_' || c.is_ascii_alphanumeric()))
                .unwrap_or(body.len()),
            Some(c) if c.is_ascii_digit() || "@*#?$!-".contains(c) => 1,
            _ => 0,
        };
        if len > 0 {
            names.push(&body[..len]);
        }
        rest = after;
    }
    names
}

fn restore_literals(text: &str) -> String {
    text.replace(LITERAL_DOLLAR, "$").replace(LITERAL_TILDE, "~")
}

/// Marks quoted or escaped characters that expansion must not touch.
fn literal(c: char) -> char {
    match c {
        '$' => LITERAL_DOLLAR,
        '~' => LITERAL_TILDE,
        other => other,
    }
}

/// Whether `option` hands `program` an inline script (`python -c`, `perl -e`).
fn is_inline_program_flag(program: &str, option: &str) -> bool {
    let flags: &[&str] = match program {
        p if p.starts_with("python") => &["-c"],
        "perl" => &["-e", "-E"],
        "ruby" | "lua" | "Rscript" => &["-e"],
        "node" | "nodejs" => &["-e", "-p", "--eval", "--print"],
        "php" => &["-r"],
        _ => return false,
    };
    flags.iter().any(|flag| {
        if flag.starts_with("--") {
            option == *flag || option.starts_with(&format!("{flag}="))
        } else {
            option.starts_with('-') && !option.starts_with("--") && option[1..].contains(&flag[1..])
        }
    })
}

/// Programs that write their path operands only with certain options.
fn writes_operands(program: &str, operands: &[&Word]) -> bool {
    match program {
        "sed" => operands.iter().any(|w| {
            w.text == "--in-place"
                || w.text.starts_with("--in-place=")
                || (w.text.starts_with('-') && !w.text.starts_with("--") && w.text.contains('i'))
        }),
        "find" => operands
            .iter()
            .any(|w| matches!(w.text.as_str(), "-delete" | "-exec" | "-execdir" | "-ok" | "-okdir")),
        _ => false,
    }
}

fn assigned_name(word: &Word) -> &str {
    word.text.split_once('=').map_or(word.text.as_str(), |(name, _)| name)
}

fn is_fd_target(target: &str) -> bool {
    target == "-" || (!target.is_empty() && target.chars().all(|c| c.is_ascii_digit()))
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => is_identifier(name),
        None => false,
    }
}

fn is_path_like(word: &str) -> bool {
    word.contains('/') || word == "." || word == ".." || word.starts_with('~')
}

/// Splits an entrypoint into tokens. Returns the tokens of the top-level
/// command line plus the body of every `$(...)` / backtick substitution,
/// which the caller audits as further command lines.
fn lex(input: &str) -> Result<(Vec<Token>, Vec<Substitution>), LexError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut substitutions = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut substituted = false;
    let mut i = 0;

    macro_rules! flush {
        () => {
            if in_word {
                tokens.push(Token::Word(Word {
                    text: std::mem::take(&mut word),
                    substituted,
                }));
                in_word = false;
                substituted = false;
            }
        };
    }

    // The word holding a substitution is the next token pushed
    macro_rules! substitution {
        ($open:expr, $body:expr, $close:expr) => {{
            let body: String = $body;
            word.push_str($open);
            word.push_str(&body);
            word.push($close);
            substitutions.push(Substitution {
                at: tokens.len(),
                body,
            });
            in_word = true;
            substituted = true;
        }};
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => {
                flush!();
                i += 1;
            }
            '\n' | ';' | '|' | '&' | '(' | ')' => {
                // `&>file` becomes a separator followed by a plain `>` redirect
                flush!();
                tokens.push(Token::Separator);
                i += 1;
            }
            '#' if !in_word => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\\' => {
                if let Some(&next) = chars.get(i + 1) {
                    if next != '\n' {
                        word.push(literal(next));
                        in_word = true;
                    }
                    i += 2;
                } else {
                    return Err(LexError("trailing backslash".to_string()));
                }
            }
            '\'' => {
                in_word = true;
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            word.push(literal(ch));
                            i += 1;
                        }
                        None => return Err(LexError("unterminated single quote".to_string())),
                    }
                }
            }
            '"' => {
                in_word = true;
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&next @ ('"' | '\\' | '$' | '`')) => word.push(literal(next)),
                                Some('\n') => {}
                                Some(&next) => {
                                    word.push('\\');
                                    word.push(next);
                                }
                                None => {
                                    return Err(LexError("unterminated double quote".to_string()))
                                }
                            }
                            i += 2;
                        }
                        Some('$') if chars.get(i + 1) == Some(&'(') => {
                            let (inner, end) = take_substitution(&chars, i + 2)?;
                            substitution!("$(", inner, ')');
                            i = end;
                        }
                        Some('`') => {
                            let (inner, end) = take_backtick(&chars, i + 1)?;
                            substitution!("`", inner, '`');
                            i = end;
                        }
                        Some('~') => {
                            word.push(LITERAL_TILDE);
                            i += 1;
                        }
                        Some(&ch) => {
                            word.push(ch);
                            i += 1;
                        }
                        None => return Err(LexError("unterminated double quote".to_string())),
                    }
                }
            }
            '$' if chars.get(i + 1) == Some(&'(') => {
                let (inner, end) = take_substitution(&chars, i + 2)?;
                substitution!("$(", inner, ')');
                i = end;
            }
            '`' => {
                let (inner, end) = take_backtick(&chars, i + 1)?;
                substitution!("`", inner, '`');
                i = end;
            }
            '<' | '>' => {
                // A word made only of digits right before the operator is a descriptor number
                if in_word && word.chars().all(|d| d.is_ascii_digit()) {
                    word.clear();
                    in_word = false;
                }
                flush!();
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('>', Some('>')) => (Redirect::Append, 2),
                    ('>', Some('&')) | ('<', Some('&')) => (Redirect::Dup, 2),
                    ('>', Some('|')) => (Redirect::Out, 2),
                    ('<', Some('>')) => (Redirect::ReadWrite, 2),
                    ('<', Some('<')) => {
                        let width = if chars.get(i + 2) == Some(&'-') { 3 } else { 2 };
                        (Redirect::HereDoc, width)
                    }
                    ('>', _) => (Redirect::Out, 1),
                    _ => (Redirect::In, 1),
                };
                tokens.push(Token::Redirect(op));
                i += width;
            }
            _ => {
                word.push(c);
                in_word = true;
                i += 1;
            }
        }
    }
    flush!();

    Ok((tokens, substitutions))
}

/// Reads a `$(...)` body starting after the opening parenthesis.
fn take_substitution(chars: &[char], start: usize) -> Result<(String, usize), LexError> {
    let mut depth = 1;
    let mut i = start;
    let mut quote: Option<char> = None;
    while i < chars.len() {
        let c = chars[i];
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Ok((chars[start..i].iter().collect(), i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(LexError("unterminated command substitution".to_string()))
}

/// Reads a backtick body starting after the opening backtick.
fn take_backtick(chars: &[char], start: usize) -> Result<(String, usize), LexError> {
    let end = chars[start..]
        .iter()
        .position(|&c| c == '`')
        .ok_or_else(|| LexError("unterminated backtick substitution".to_string()))?;
    Ok((chars[start..start + end].iter().collect(), start + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/sandbox".to_string());
        env.insert("DATA".to_string(), "/data".to_string());
        env
    }

    fn accesses(cmd: &str) -> Vec<(String, AccessMode)> {
        scan(cmd, &env())
            .unwrap()
            .into_iter()
            .filter(|a| a.unresolved.is_none())
            .map(|a| (a.path, a.mode))
            .collect()
    }

    fn unresolved(cmd: &str) -> Vec<(String, AccessMode)> {
        scan(cmd, &env())
            .unwrap()
            .into_iter()
            .filter(|a| a.unresolved.is_some())
            .map(|a| (a.path, a.mode))
            .collect()
    }

    // ── Plain commands ────────────────────────────────────

    #[test]
    fn test_no_paths_no_accesses() {
        assert!(accesses("echo hi").is_empty());
        assert!(accesses("printf '%s\\n' hello world").is_empty());
    }

    #[test]
    fn test_path_arguments_are_reads() {
        assert_eq!(
            accesses("cat /etc/hostname"),
            vec![("/etc/hostname".to_string(), AccessMode::Read)]
        );
    }

    #[test]
    fn test_path_program_needs_execute() {
        assert_eq!(
            accesses("/opt/tool/run --fast"),
            vec![("/opt/tool/run".to_string(), AccessMode::Execute)]
        );
    }

    #[test]
    fn test_mutating_programs_write() {
        assert_eq!(
            accesses("touch /data/x && rm -rf /data/y"),
            vec![
                ("/data/x".to_string(), AccessMode::Write),
                ("/data/y".to_string(), AccessMode::Write),
            ]
        );
    }

    #[test]
    fn test_copy_destination_is_write() {
        assert_eq!(
            accesses("cp -r /src/a /dst/b"),
            vec![
                ("/src/a".to_string(), AccessMode::Read),
                ("/dst/b".to_string(), AccessMode::Write),
            ]
        );
    }

    #[test]
    fn test_dd_operands() {
        assert_eq!(
            accesses("dd if=/in of=/out bs=1"),
            vec![
                ("/in".to_string(), AccessMode::Read),
                ("/out".to_string(), AccessMode::Write),
            ]
        );
    }

    #[test]
    fn test_in_place_edits_write() {
        assert!(accesses("sed -i s/a/b/ /data/f").contains(&("/data/f".to_string(), AccessMode::Write)));
        assert!(accesses("sed s/a/b/ /data/f").contains(&("/data/f".to_string(), AccessMode::Read)));
        assert!(accesses("find /data -name '*.tmp' -delete").contains(&("/data".to_string(), AccessMode::Write)));
    }

    // ── Redirections ──────────────────────────────────────

    #[test]
    fn test_redirections() {
        assert_eq!(
            accesses("sort < /data/in > /data/out"),
            vec![
                ("/data/in".to_string(), AccessMode::Read),
                ("/data/out".to_string(), AccessMode::Write),
            ]
        );
        assert_eq!(
            accesses("echo hi>>/data/log"),
            vec![("/data/log".to_string(), AccessMode::Write)]
        );
    }

    #[test]
    fn test_fd_duplication_is_not_a_path() {
        assert_eq!(
            accesses("echo hi 2>&1 1>/dev/null"),
            vec![("/dev/null".to_string(), AccessMode::Write)]
        );
    }

    #[test]
    fn test_quoted_operators_are_literal() {
        assert!(accesses("echo 'a > /etc/b'").is_empty());
        assert!(accesses("echo \"a | b > c\"").is_empty());
    }

    #[test]
    fn test_comment_ignored() {
        assert!(accesses("echo hi # > /etc/passwd").is_empty());
    }

    // ── Expansion and nesting ─────────────────────────────

    #[test]
    fn test_variables_expand_against_env() {
        assert_eq!(
            accesses("cat $DATA/in ${HOME}/x ~/y"),
            vec![
                ("/data/in".to_string(), AccessMode::Read),
                ("/sandbox/x".to_string(), AccessMode::Read),
                ("/sandbox/y".to_string(), AccessMode::Read),
            ]
        );
    }

    #[test]
    fn test_unknown_variable_expands_empty() {
        assert_eq!(
            accesses("cat $NOPE/etc/passwd"),
            vec![("/etc/passwd".to_string(), AccessMode::Read)]
        );
    }

    #[test]
    fn test_single_quotes_suppress_expansion() {
        assert_eq!(
            accesses("awk '{print $1}' /data/in"),
            vec![("/data/in".to_string(), AccessMode::Read)]
        );
        assert!(unresolved("awk '{print $1}' /data/in").is_empty());
        assert_eq!(
            accesses("cat '~/x'"),
            vec![("~/x".to_string(), AccessMode::Read)]
        );
    }

    #[test]
    fn test_script_assignments_are_followed() {
        assert!(accesses("F=/data/in; cat $F").contains(&("/data/in".to_string(), AccessMode::Read)));
        // A prefix assignment does not change the command's own arguments
        assert_eq!(
            accesses("X=/data cat $X/in"),
            vec![
                ("/data".to_string(), AccessMode::Read),
                ("/in".to_string(), AccessMode::Read),
            ]
        );
    }

    #[test]
    fn test_command_substitution_is_audited() {
        assert_eq!(
            accesses("echo $(cat /etc/shadow) \"`cat /root/key`\""),
            vec![
                ("/etc/shadow".to_string(), AccessMode::Read),
                ("/root/key".to_string(), AccessMode::Read),
            ]
        );
        assert!(unresolved("echo $(cat /etc/shadow)").is_empty());
    }

    #[test]
    fn test_substituted_targets_are_unresolved() {
        assert_eq!(
            unresolved("cat $(printf '\\057etc\\057hostname')"),
            vec![(
                "$(printf '\\057etc\\057hostname')".to_string(),
                AccessMode::Read
            )]
        );
        assert_eq!(
            unresolved("echo x > \"$(echo /etc/motd)\""),
            vec![("$(echo /etc/motd)".to_string(), AccessMode::Write)]
        );
        assert_eq!(
            unresolved("`echo cat` /etc/passwd"),
            vec![("`echo cat`".to_string(), AccessMode::Execute)]
        );
        assert_eq!(unresolved("touch $(mktemp -u)")[0].1, AccessMode::Write);
    }

    #[test]
    fn test_runtime_bound_variables_are_unresolved() {
        assert_eq!(
            unresolved("F=$(cat list); cat $F"),
            vec![("$F".to_string(), AccessMode::Read)]
        );
        assert_eq!(
            unresolved("while read f; do rm \"$f\"; done < /data/list"),
            vec![("$f".to_string(), AccessMode::Write)]
        );
        assert_eq!(
            unresolved("for f in /data/*; do cat $f; done"),
            vec![("$f".to_string(), AccessMode::Read)]
        );
        assert!(!unresolved("cat $PWD/x").is_empty());
        assert!(!unresolved("cat $1").is_empty());
    }

    #[test]
    fn test_nested_shell_is_audited() {
        assert_eq!(
            accesses("sh -c 'echo x > /etc/motd'"),
            vec![("/etc/motd".to_string(), AccessMode::Write)]
        );
        assert_eq!(
            accesses("eval cat /etc/passwd"),
            vec![("/etc/passwd".to_string(), AccessMode::Read)]
        );
        assert_eq!(
            accesses("bash -ec 'cat /etc/passwd'"),
            vec![("/etc/passwd".to_string(), AccessMode::Read)]
        );
    }

    #[test]
    fn test_nested_shell_positional_parameters() {
        let cmd = "sh -c 'cat $1' _ /etc/hostname";
        assert!(accesses(cmd).contains(&("/etc/hostname".to_string(), AccessMode::Read)));
        assert_eq!(unresolved(cmd), vec![("$1".to_string(), AccessMode::Read)]);
    }

    #[test]
    fn test_assignment_prefix_skipped() {
        assert_eq!(
            accesses("LANG=C cat ./local"),
            vec![("./local".to_string(), AccessMode::Read)]
        );
    }

    // ── Working directory ─────────────────────────────────

    #[test]
    fn test_cd_anchors_relative_targets() {
        assert_eq!(
            accesses("cd /data && echo x > out.txt"),
            vec![
                ("/data".to_string(), AccessMode::Read),
                ("/data/out.txt".to_string(), AccessMode::Write),
            ]
        );
        assert_eq!(
            accesses("cd /data; cd sub; touch new"),
            vec![
                ("/data".to_string(), AccessMode::Read),
                ("/data/sub".to_string(), AccessMode::Read),
                ("/data/sub/new".to_string(), AccessMode::Write),
            ]
        );
        assert!(accesses("cd $DATA && cat in").contains(&("/data/in".to_string(), AccessMode::Read)));
    }

    #[test]
    fn test_cd_carries_into_nested_commands() {
        assert!(accesses("cd /data && sh -c 'echo x > out'").contains(&("/data/out".to_string(), AccessMode::Write)));
        assert!(accesses("cd /data && echo $(cat in)").contains(&("/data/in".to_string(), AccessMode::Read)));
    }

    #[test]
    fn test_cd_home_and_unknown_targets() {
        assert_eq!(
            accesses("cd && cat f"),
            vec![
                ("/sandbox".to_string(), AccessMode::Read),
                ("/sandbox/f".to_string(), AccessMode::Read),
            ]
        );
        assert!(!unresolved("cd $(mktemp -d) && touch x").is_empty());
        assert!(!unresolved("cd - && touch x").is_empty());
        assert!(!unresolved("pushd /data; popd; touch x").is_empty());
    }

    // ── Opaque programs ───────────────────────────────────

    #[test]
    fn test_inline_interpreter_programs_are_unresolved() {
        for cmd in [
            "python3 -c \"open('/etc/hostname').read()\"",
            "perl -ne 'print' /data/in",
            "node -e 'require(\"fs\").readFileSync(\"/etc/passwd\")'",
            "ruby -e 'File.read(\"/etc/passwd\")'",
        ] {
            assert_eq!(unresolved(cmd).len(), 1, "{cmd}");
            assert_eq!(unresolved(cmd)[0].1, AccessMode::Execute, "{cmd}");
        }
        assert!(unresolved("python3 ./tool.py").is_empty());
    }

    #[test]
    fn test_stdin_driven_commands_are_unresolved() {
        assert!(!unresolved("find /data -name '*.log' | xargs rm").is_empty());
        assert!(!unresolved("echo 'cat /etc/passwd' | sh").is_empty());
        assert_eq!(
            accesses("sh /opt/tools/build.sh /data/in"),
            vec![
                ("/opt/tools/build.sh".to_string(), AccessMode::Execute),
                ("/data/in".to_string(), AccessMode::Read),
            ]
        );
        assert!(!unresolved(". ./env.sh").is_empty());
        assert!(!unresolved("source ./env.sh").is_empty());
    }

    // ── Validation ────────────────────────────────────────

    #[test]
    fn test_validate_rejects_unbalanced_quotes() {
        assert!(validate("echo 'oops").is_err());
        assert!(validate("echo \"oops").is_err());
        assert!(validate("echo $(oops").is_err());
        assert!(validate("echo 'fine'").is_ok());
    }
}
