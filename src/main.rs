mod cli;

use crate::cli::{App, Args};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let statements = args.statements()?;

    let mut app = App::new(&args)?;
    let failed = app.run(&statements)?;
    app.finish(args.backup.as_deref())?;

    if failed > 0 {
        anyhow::bail!("{} of {} statement(s) failed", failed, statements.len());
    }
    Ok(())
}
