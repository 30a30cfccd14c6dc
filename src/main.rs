use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod errors;
mod language;
mod model;
mod pipeline;
mod pool;
mod prelude;
mod rasterize;
mod recognize;
mod session;
mod ui;

/// Turn PDFs and images into page-ordered OCR text.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - DOCQUERY_MAX_CONCURRENT_PAGES: Pages recognized at once (default: CPUs).
  - DOCQUERY_PAGE_TIMEOUT: Seconds allowed per page (default: 120).
  - DOCQUERY_CONFIDENCE_THRESHOLD: Confidence needed to skip fallback
    languages (default: 0.6).
  - DOCQUERY_INSTALLED_LANGUAGES: Language packs to use instead of asking
    tesseract.
  - DOCQUERY_RASTERIZE_DPI: PDF rendering resolution (default: 300).
  - DOCQUERY_IGNORE_TEXT_LAYER: OCR PDF pages even if they contain text.

  Requires `tesseract`, plus `pdfinfo` and `pdftocairo` from poppler-utils
  for PDFs. These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR PDFs and images, writing one JSON line per document.
    Ocr(cmd::ocr::OcrOpts),
    /// List the installed language packs we can use.
    Languages(cmd::languages::LanguagesOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Languages(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Ocr(ocr_opts) => {
            cmd::ocr::cmd_ocr(ui, ocr_opts).await?;
        }
        Cmd::Languages(languages_opts) => {
            cmd::languages::cmd_languages(languages_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
