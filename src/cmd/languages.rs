//! The `languages` subcommand.

use clap::Args;
use tokio::io::{AsyncWriteExt as _, stdout};

use crate::{config::PipelineOpts, prelude::*};

/// Languages command line arguments.
#[derive(Debug, Args)]
pub struct LanguagesOpts {
    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `languages` subcommand. Prints one installed language pack per line.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_languages(opts: &LanguagesOpts) -> Result<()> {
    let installed = opts.pipeline.installed_languages().await?;
    let mut out = String::new();
    for language in installed.iter() {
        out.push_str(language.code());
        out.push('\n');
    }
    let mut wtr = stdout();
    wtr.write_all(out.as_bytes())
        .await
        .context("failed to write languages")?;
    wtr.flush().await.context("failed to flush languages")?;
    Ok(())
}
