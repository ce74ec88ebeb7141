//! The `languages` subcommand.

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

/// List the languages Tesseract has installed, one per line.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_languages() -> Result<()> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .await
        .context("cannot run tesseract")?;
    check_for_command_failure("tesseract", &output, None)?;

    // Older versions of Tesseract print the list on stderr.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    for code in parse_language_list(&text) {
        println!("{code}");
    }
    Ok(())
}

/// Pull language codes out of `tesseract --list-langs` output.
fn parse_language_list(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of") && !line.ends_with(':'))
        // "osd" is orientation detection, not a language.
        .filter(|line| *line != "osd")
        .collect()
}
