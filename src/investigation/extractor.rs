//! Recognition of tool invocations in free-form model output.
//!
//! Each textual convention is a separate [`Grammar`]. The extractor applies
//! them in a fixed order and collapses repeats through one shared set keyed
//! by the upper-cased tool name and the trimmed argument string.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::builtin_regex;

/// Canonical tool name for kubectl invocations.
pub const KUBECTL_TOOL: &str = "RUN_KUBECTL";

/// One structured tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractedCommand {
    pub tool: String,
    pub args: String,
}

impl ExtractedCommand {
    /// Build a command with a canonical (upper-cased) tool name and trimmed args.
    pub fn new(tool: impl AsRef<str>, args: impl AsRef<str>) -> Self {
        Self {
            tool: tool.as_ref().trim().to_uppercase(),
            args: args.as_ref().trim().to_string(),
        }
    }

    /// Whitespace-normalized `TOOL args` signature used for repeat detection.
    pub fn signature(&self) -> String {
        let args = self.args.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{}:{}", self.tool.to_uppercase(), args)
    }
}

impl std::fmt::Display for ExtractedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.tool)
        } else {
            write!(f, "{} {}", self.tool, self.args)
        }
    }
}

/// Textual conventions for expressing a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    /// `TOOL: NAME args`
    Directive,
    /// `$ kubectl args`
    ShellPrompt,
    /// `` `kubectl args` ``
    InlineCode,
    /// `kubectl <verb> ...` at the start of a line
    BareLine,
}

/// kubectl subcommands accepted in the bare-line form.
const KUBECTL_VERBS: &[&str] = &[
    "get",
    "describe",
    "logs",
    "top",
    "events",
    "explain",
    "api-resources",
    "api-versions",
    "cluster-info",
    "version",
    "rollout",
    "auth",
    "config",
    "exec",
    "diff",
];

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(
        r"(?im)^[ \t]*(?:>[ \t]*)?(?:[-*+][ \t]+|\d+[.)][ \t]+)?[*_]{0,3}tool[*_]{0,3}(?:[ \t]*[:=][ \t]*|[ \t]+)[*_`]{0,3}[ \t]*[*_`]{0,3}([A-Za-z][A-Za-z0-9_]*)[*_`]{0,3}:?(?:[ \t]+(.*))?$",
    )
});

static SHELL_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| builtin_regex(r"(?m)^[ \t]*(?:[-*+][ \t]+)?\$[ \t]*kubectl[ \t]+(.+)$"));

static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| builtin_regex(r"`[ \t]*kubectl[ \t]+([^`\n]+)`"));

static BARE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    let verbs = KUBECTL_VERBS
        .iter()
        .map(|v| regex::escape(v))
        .collect::<Vec<_>>()
        .join("|");
    builtin_regex(&format!(
        r"(?m)^[ \t]*kubectl[ \t]+((?:{verbs})(?:[ \t][^\n]*)?)$"
    ))
});

static THOUGHT_MARKER: LazyLock<Regex> = LazyLock::new(|| builtin_regex(r"(?i)\bthought\s*:"));

/// Separators that introduce an explanatory clause after directive args.
const CLAUSE_SEPARATORS: &[&str] = &[" - ", " \u{2014} ", " \u{2013} ", " // "];

impl Grammar {
    /// Default application order.
    pub const ALL: [Grammar; 4] = [
        Grammar::Directive,
        Grammar::ShellPrompt,
        Grammar::InlineCode,
        Grammar::BareLine,
    ];

    /// Every invocation this grammar recognizes in `text`, in text order.
    pub fn scan(&self, text: &str) -> Vec<ExtractedCommand> {
        match self {
            Grammar::Directive => DIRECTIVE
                .captures_iter(text)
                .filter_map(|caps| {
                    let name = caps.get(1)?.as_str();
                    if !looks_like_tool_name(name) {
                        return None;
                    }
                    let raw = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                    let tool = name.to_uppercase();
                    let mut args = clean_directive_args(raw);
                    if tool == KUBECTL_TOOL {
                        args = strip_kubectl(&args).to_string();
                    }
                    Some(ExtractedCommand::new(tool, args))
                })
                .collect(),
            Grammar::ShellPrompt => kubectl_matches(&SHELL_PROMPT, text),
            Grammar::InlineCode => kubectl_matches(&INLINE_CODE, text),
            Grammar::BareLine => kubectl_matches(&BARE_LINE, text),
        }
    }
}

fn kubectl_matches(pattern: &Regex, text: &str) -> Vec<ExtractedCommand> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let args = caps
                .get(1)?
                .as_str()
                .trim()
                .trim_end_matches(['`', '*'])
                .trim();
            (!args.is_empty()).then(|| ExtractedCommand::new(KUBECTL_TOOL, args))
        })
        .collect()
}

/// Tool identifiers are upper case or snake case; prose words are neither.
fn looks_like_tool_name(name: &str) -> bool {
    let has_letter = name.chars().any(|c| c.is_ascii_alphabetic());
    let all_upper = name
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    has_letter && (all_upper || name.contains('_'))
}

fn strip_kubectl(args: &str) -> &str {
    match args.strip_prefix("kubectl") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
        _ => args,
    }
}

fn clean_directive_args(raw: &str) -> String {
    let mut args = raw;

    if let Some(m) = THOUGHT_MARKER.find(args) {
        args = &args[..m.start()];
    }
    for separator in CLAUSE_SEPARATORS {
        if let Some(pos) = args.find(separator) {
            args = &args[..pos];
        }
    }

    let mut args = args.trim();
    loop {
        let before = args;
        args = args.trim_end_matches(['*', '_', '`']).trim_end();
        args = strip_trailing_aside(args).trim_end();
        if args == before {
            break;
        }
    }
    args.trim_start_matches(['*', '_', '`']).trim().to_string()
}

/// Remove one balanced `(...)` group at the end, when preceded by whitespace.
fn strip_trailing_aside(args: &str) -> &str {
    if !args.ends_with(')') {
        return args;
    }
    let mut depth = 0usize;
    for (idx, ch) in args.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let head = &args[..idx];
                    return if head.ends_with(char::is_whitespace) {
                        head
                    } else {
                        args
                    };
                }
            }
            _ => {}
        }
    }
    args
}

/// Applies every grammar in order with one shared dedup set.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    grammars: Vec<Grammar>,
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self {
            grammars: Grammar::ALL.to_vec(),
        }
    }
}

impl CommandExtractor {
    /// Extractor with every built-in grammar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extractor restricted to the given grammars, applied in the given order.
    pub fn with_grammars(grammars: impl IntoIterator<Item = Grammar>) -> Self {
        Self {
            grammars: grammars.into_iter().collect(),
        }
    }

    /// Deduplicated invocations in first-seen order. Never fails.
    pub fn extract(&self, text: &str) -> Vec<ExtractedCommand> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut commands = Vec::new();
        for grammar in &self.grammars {
            for command in grammar.scan(text) {
                let key = (command.tool.to_uppercase(), command.args.trim().to_string());
                if seen.insert(key) {
                    commands.push(command);
                }
            }
        }
        commands
    }
}

/// Extract with the default grammar set.
pub fn extract_commands(text: &str) -> Vec<ExtractedCommand> {
    CommandExtractor::default().extract(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmd(tool: &str, args: &str) -> ExtractedCommand {
        ExtractedCommand::new(tool, args)
    }

    #[test]
    fn test_shell_prompt() {
        assert_eq!(
            extract_commands("$ kubectl get pods -A"),
            vec![cmd("RUN_KUBECTL", "get pods -A")]
        );
    }

    #[test]
    fn test_directive() {
        assert_eq!(
            extract_commands("TOOL: SEARCH_KNOWLEDGE pod crashloop causes"),
            vec![cmd("SEARCH_KNOWLEDGE", "pod crashloop causes")]
        );
    }

    #[test]
    fn test_directive_tolerates_markdown_and_case() {
        let text = "Next step:\n- **TOOL:** RUN_KUBECTL describe pod api-1 -n prod**\n1. tool: get_events prod";
        assert_eq!(
            extract_commands(text),
            vec![
                cmd("RUN_KUBECTL", "describe pod api-1 -n prod"),
                cmd("GET_EVENTS", "prod"),
            ]
        );
    }

    #[test]
    fn test_directive_cuts_thought_clause_and_aside() {
        let text = "TOOL: RUN_KUBECTL logs api-1 -n prod THOUGHT: the logs should show the panic\n\
                    TOOL: RUN_KUBECTL get nodes - to check node pressure\n\
                    TOOL: RUN_KUBECTL top pods (memory usage)\n\
                    TOOL: SEARCH_KNOWLEDGE oom \u{2014} known issues";
        assert_eq!(
            extract_commands(text),
            vec![
                cmd("RUN_KUBECTL", "logs api-1 -n prod"),
                cmd("RUN_KUBECTL", "get nodes"),
                cmd("RUN_KUBECTL", "top pods"),
                cmd("SEARCH_KNOWLEDGE", "oom"),
            ]
        );
    }

    #[test]
    fn test_directive_keeps_flag_values_with_parentheses() {
        assert_eq!(
            extract_commands("TOOL: RUN_KUBECTL get pods -o=custom-columns=NAME:(.metadata.name)"),
            vec![cmd(
                "RUN_KUBECTL",
                "get pods -o=custom-columns=NAME:(.metadata.name)"
            )]
        );
    }

    #[test]
    fn test_directive_requires_tool_like_name() {
        assert!(extract_commands("Tool: we should look at the nodes").is_empty());
        assert!(extract_commands("The tools are working fine").is_empty());
    }

    #[test]
    fn test_inline_code_anywhere() {
        assert_eq!(
            extract_commands("You can run `kubectl describe node worker-2` to see conditions."),
            vec![cmd("RUN_KUBECTL", "describe node worker-2")]
        );
    }

    #[test]
    fn test_bare_line_requires_known_verb() {
        let text = "kubectl get deploy -n prod\nkubectl is the CLI you use\n  kubectl logs api-1";
        assert_eq!(
            extract_commands(text),
            vec![
                cmd("RUN_KUBECTL", "get deploy -n prod"),
                cmd("RUN_KUBECTL", "logs api-1"),
            ]
        );
    }

    #[test]
    fn test_conventions_collapse_to_one_entry() {
        let text = "TOOL: RUN_KUBECTL kubectl get pods -A\n\
                    $ kubectl get pods -A\n\
                    Run `kubectl get pods -A` first.\n\
                    kubectl get pods -A";
        assert_eq!(extract_commands(text), vec![cmd("RUN_KUBECTL", "get pods -A")]);
    }

    #[test]
    fn test_first_seen_order_across_grammars() {
        let text = "$ kubectl get pods\nTOOL: SEARCH_KNOWLEDGE crashloop";
        assert_eq!(
            extract_commands(text),
            vec![
                cmd("SEARCH_KNOWLEDGE", "crashloop"),
                cmd("RUN_KUBECTL", "get pods"),
            ]
        );
    }

    #[test]
    fn test_args_compare_case_sensitively() {
        let text = "$ kubectl get pods -n Prod\n$ kubectl get pods -n prod";
        assert_eq!(extract_commands(text).len(), 2);
    }

    #[test]
    fn test_empty_and_prose_yield_nothing() {
        assert!(extract_commands("").is_empty());
        assert!(extract_commands("   \n\t ").is_empty());
        assert!(extract_commands("Thanks, that fixed it!").is_empty());
        assert!(extract_commands("I think kubectl would help here.").is_empty());
        assert!(extract_commands("kubectl").is_empty());
        assert!(extract_commands("$ kubectl").is_empty());
    }

    #[test]
    fn test_restricted_grammars() {
        let extractor = CommandExtractor::with_grammars([Grammar::ShellPrompt]);
        let text = "TOOL: SEARCH_KNOWLEDGE x\n$ kubectl get ns";
        assert_eq!(extractor.extract(text), vec![cmd("RUN_KUBECTL", "get ns")]);
    }

    #[test]
    fn test_signature_normalizes_whitespace() {
        assert_eq!(
            cmd("run_kubectl", "get   pods  -A").signature(),
            cmd("RUN_KUBECTL", "get pods -A").signature()
        );
    }
}
