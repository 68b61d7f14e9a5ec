use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Run a map or reduce executable as `<program> [args...] <input> <output>`
/// from `cwd`. Only the exit status decides whether it worked.
pub async fn run_executable(executable: &str, cwd: &Path, input: &Path, output: &Path) -> Result<()> {
    let words = shell_words::split(executable)
        .with_context(|| format!("could not parse executable `{executable}`"))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| anyhow!("no executable given"))?;

    let mut command = Command::new(program);
    command.args(args).arg(input).arg(output).current_dir(cwd);
    debug!("Running {:?}", command.as_std());

    let status = command
        .status()
        .await
        .with_context(|| format!("could not start `{program}`"))?;
    if !status.success() {
        bail!("`{}` on {} exited with {}", executable, input.display(), status);
    }
    Ok(())
}
