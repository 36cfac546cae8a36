//! Text map of the included tree and the symbols found in each file.

use std::fmt::Write;

use repo2gpt_core::tokens::{TokenizeError, Tokenizer};

use crate::summarize::{Symbol, SymbolKind};

const INDENT: &str = "    ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repomap {
    pub text: String,
    pub token_count: u64,
    pub file_count: usize,
}

/// One included file and its extracted symbols.
#[derive(Clone, Debug)]
pub struct MappedFile {
    pub relative_path: String,
    pub symbols: Vec<Symbol>,
}

/// Render `files` under `root_name`. Output depends only on the inputs; files
/// are ordered by path regardless of the order given.
pub fn build_repomap(
    root_name: &str,
    files: &[MappedFile],
    tokenizer: &dyn Tokenizer,
) -> Result<Repomap, TokenizeError> {
    let mut sorted: Vec<&MappedFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut text = String::new();
    let _ = writeln!(text, "{root_name}");

    let mut open_dirs: Vec<&str> = Vec::new();
    for file in &sorted {
        let mut parts: Vec<&str> = file.relative_path.split('/').collect();
        let Some(name) = parts.pop() else { continue };

        let common = open_dirs
            .iter()
            .zip(&parts)
            .take_while(|(a, b)| a == b)
            .count();
        open_dirs.truncate(common);
        for dir in &parts[common..] {
            let _ = writeln!(text, "{}{dir}", INDENT.repeat(open_dirs.len() + 1));
            open_dirs.push(*dir);
        }

        let depth = open_dirs.len() + 1;
        let _ = writeln!(text, "{}{name}", INDENT.repeat(depth));
        write_symbols(&mut text, &file.symbols, depth + 1);
    }

    Ok(Repomap {
        token_count: tokenizer.count(&text)?,
        file_count: sorted.len(),
        text,
    })
}

fn write_symbols(out: &mut String, symbols: &[Symbol], depth: usize) {
    for (kind, heading) in [
        (SymbolKind::Class, "Classes:"),
        (SymbolKind::Type, "Types:"),
        (SymbolKind::Function, "Functions:"),
    ] {
        let mut group = symbols.iter().filter(|s| s.kind == kind).peekable();
        if group.peek().is_none() {
            continue;
        }
        let _ = writeln!(out, "{}{heading}", INDENT.repeat(depth));
        for symbol in group {
            let _ = writeln!(
                out,
                "{}{} (Line {})",
                INDENT.repeat(depth + 1),
                symbol.name,
                symbol.line
            );
        }
    }
}
