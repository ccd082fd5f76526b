//! Reset command handler

use std::io::{self, Write};

use anyhow::{Context, Result};

use sqlport_core::Store;

use crate::output::Output;

/// Drop and recreate the primary database
pub async fn reset(store: &Store, yes: bool, output: &Output) -> Result<()> {
    if !yes && output.should_prompt() {
        print!(
            "This deletes {} and recreates it empty. Continue? [y/N] ",
            store.config().database_path().display()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    store.reset().await.context("Failed to reset database")?;
    output.success(&format!(
        "Reset {}",
        store.config().database_path().display()
    ));
    Ok(())
}
