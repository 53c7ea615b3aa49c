//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the gateway MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::io`, async `reqwest`.
//! **Exceptions**: plain functions that run before or outside the runtime
//! (configuration loading), test code.

use architectural_enforcement::{find_blocking_io_violations, production_sources};

#[test]
fn test_no_blocking_io_in_production_code() {
    let sources = production_sources();
    assert!(
        !sources.is_empty(),
        "No production sources found; check PRODUCTION_DIRS"
    );

    let violations = find_blocking_io_violations(&sources);
    if !violations.is_empty() {
        eprintln!("\nCRITICAL: Blocking I/O calls found in async code!\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }

        eprintln!("\nFORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::*, std::net::*, std::process::Command");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("  - std::io::stdin() / std::io::stdout() in async functions");
        eprintln!("\nREQUIRED async I/O:");
        eprintln!("  - tokio::fs, tokio::net, tokio::io::{{stdin, stdout}}");
        eprintln!("\nACCEPTABLE blocking I/O:");
        eprintln!("  - Non-async functions (configuration loading before dispatch)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_dead_letters_use_async_file_io() {
    let sources = production_sources();
    let sink = sources
        .iter()
        .find(|s| s.path.ends_with("dispatch/dead_letter.rs"))
        .expect("dead_letter.rs is scanned");

    assert!(sink.lines().iter().any(|l| l.contains("tokio::fs")));
}
