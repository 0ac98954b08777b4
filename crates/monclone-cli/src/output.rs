//! Terminal output helpers for the show commands and run summaries.

use serde_json::Value;

/// Pretty-print a JSON value with a rule underneath, the way version and
/// record dumps read best in a terminal.
pub fn print_block(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            for line in text.lines() {
                println!("    {line}");
            }
        }
        Err(_) => println!("    {value}"),
    }
    println!("    {}", "-".repeat(72));
}

/// Section heading filled to a rule.
pub fn print_heading(title: &str) {
    let width = 76usize.saturating_sub(title.len());
    println!("{title}{}", "-".repeat(width));
}

/// Per-record failure summary after a partially successful run.
pub fn print_failures(failures: &[(String, String)]) {
    if failures.is_empty() {
        return;
    }
    print_heading("Failed records:");
    for (record, error) in failures {
        println!("    {record}: {error}");
    }
}
