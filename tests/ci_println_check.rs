//! CI validation tests for println! usage
//!
//! Library modules run inside the server as well as the CLI, so they report
//! through `log` and leave terminal output to `src/cli` and the binaries.

use std::fs;
use std::path::{Path, PathBuf};

const LIBRARY_DIRS: [&str; 6] = [
    "src/services",
    "src/utils",
    "src/models",
    "src/config",
    "src/remote",
    "src/server/routes",
];

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

fn print_lines(content: &str) -> Vec<usize> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            (trimmed.contains("println!") || trimmed.contains("eprintln!"))
                && !trimmed.starts_with("//")
        })
        .map(|(n, _)| n + 1)
        .collect()
}

/// Test that library modules use log macros instead of printing
#[test]
fn test_no_println_in_library_modules() {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    for dir in LIBRARY_DIRS {
        rust_files(&manifest.join(dir), &mut files);
    }
    assert!(!files.is_empty(), "no library sources found");

    let offenders: Vec<_> = files
        .iter()
        .filter_map(|path| {
            let content = fs::read_to_string(path)
                .unwrap_or_else(|_| panic!("Failed to read {}", path.display()));
            let lines = print_lines(&content);
            (!lines.is_empty()).then(|| format!("{}: lines {:?}", path.display(), lines))
        })
        .collect();

    assert!(
        offenders.is_empty(),
        "Found println!/eprintln! in library modules, use log macros instead:\n{}",
        offenders.join("\n")
    );
}

/// Test that the CLI runner and the server binary initialize logging
#[test]
fn test_entry_points_initialize_logging() {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    for (file, init) in [
        ("src/cli/mod.rs", "init_cli_logging"),
        ("src/bin/labflash-server.rs", "init_server_logging"),
    ] {
        let content = fs::read_to_string(manifest.join(file))
            .unwrap_or_else(|_| panic!("Failed to read {}", file));
        assert!(content.contains(init), "{} should call {}", file, init);
    }
}

/// Test that CLI args support logging configuration
#[test]
fn test_cli_logging_arguments() {
    use clap::Parser;
    use labflash::cli::args::Cli;

    let cli = Cli::try_parse_from(["labflash", "-v", "devices"]).expect("Should parse verbose flag");
    assert_eq!(cli.verbose, 1);

    let cli = Cli::try_parse_from(["labflash", "--quiet", "devices"]).expect("Should parse quiet flag");
    assert!(cli.quiet);

    let cli = Cli::try_parse_from(["labflash", "-vv", "ports"]).expect("Should parse multiple verbose flags");
    assert_eq!(cli.verbose, 2);
}
