mod cli;
mod discover;
mod run;

use anyhow::Result;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    let exit_code = run::run(cli)?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
