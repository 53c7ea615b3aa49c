//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the gateway MUST NOT sleep. Waiting happens
//! on I/O, notifications or deadlines.
//! **Exceptions**: exponential backoff between retries, periodic interval
//! tasks, test code.

use architectural_enforcement::{find_sleep_violations, production_sources};

#[test]
fn test_no_sleep_in_production_code() {
    let sources = production_sources();
    assert!(
        !sources.is_empty(),
        "No production sources found; check PRODUCTION_DIRS"
    );

    let violations = find_sleep_violations(&sources);
    if !violations.is_empty() {
        eprintln!("\nCRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }

        eprintln!("\nACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff between retry attempts");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("\nFORBIDDEN:");
        eprintln!("  - Sleep in polling loops (wait on a Notify or channel)");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
