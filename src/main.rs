use anyhow::Result;

use pcsc_script_loader::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
