// Module: Loader
// Reads an optional initial-context file passed to the CLI.

use anyhow::Context;
use std::fs;
use std::path::Path;

pub fn load_initial_context<P: AsRef<Path>>(path: P) -> anyhow::Result<String> {
    fs::read_to_string(path).context("failed to read context file")
}
