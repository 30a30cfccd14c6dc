//! Pipeline configuration.
//!
//! Every option can be set on the command line, through the environment, or in
//! a `.env` file.

use std::time::Duration;

use clap::Args;

use crate::{
    language::{InstalledLanguages, Language},
    prelude::*,
    recognize::tesseract,
};

/// Options shared by everything that builds a pipeline.
#[derive(Args, Clone, Debug)]
pub struct PipelineOpts {
    /// Maximum number of pages recognized at once, across all documents.
    /// Defaults to the number of CPUs.
    #[clap(long, env = "DOCQUERY_MAX_CONCURRENT_PAGES")]
    pub max_concurrent_pages: Option<usize>,

    /// Seconds a single page may take, across all requested languages,
    /// before it is marked as failed.
    #[clap(long, env = "DOCQUERY_PAGE_TIMEOUT", default_value = "120")]
    pub page_timeout: u64,

    /// Accept the first language whose confidence reaches this value (0.0 to
    /// 1.0). Otherwise, keep the most confident attempt.
    #[clap(long, env = "DOCQUERY_CONFIDENCE_THRESHOLD", default_value = "0.6")]
    pub confidence_threshold: f32,

    /// Comma-separated language packs to treat as installed. Defaults to
    /// asking `tesseract --list-langs`.
    #[clap(long, env = "DOCQUERY_INSTALLED_LANGUAGES", value_delimiter = ',')]
    pub installed_languages: Option<Vec<Language>>,

    /// The DPI to use when rendering PDF pages.
    #[clap(long, env = "DOCQUERY_RASTERIZE_DPI", default_value = "300")]
    pub rasterize_dpi: u32,

    /// Skip grayscale conversion before recognition.
    #[clap(long, env = "DOCQUERY_KEEP_COLOR")]
    pub keep_color: bool,

    /// OCR every PDF page, even ones that already contain text.
    #[clap(long, env = "DOCQUERY_IGNORE_TEXT_LAYER")]
    pub ignore_text_layer: bool,
}

impl Default for PipelineOpts {
    fn default() -> Self {
        Self {
            max_concurrent_pages: None,
            page_timeout: 120,
            confidence_threshold: 0.6,
            installed_languages: None,
            rasterize_dpi: 300,
            keep_color: false,
            ignore_text_layer: false,
        }
    }
}

impl PipelineOpts {
    /// Reject values outside their allowed ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_pages == Some(0) {
            return Err(anyhow!("--max-concurrent-pages must be greater than 0"));
        }
        if self.page_timeout == 0 {
            return Err(anyhow!("--page-timeout must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "--confidence-threshold must be between 0.0 and 1.0, got {}",
                self.confidence_threshold
            ));
        }
        if self.rasterize_dpi == 0 {
            return Err(anyhow!("--rasterize-dpi must be greater than 0"));
        }
        Ok(())
    }

    pub fn max_concurrent_pages(&self) -> usize {
        self.max_concurrent_pages.unwrap_or_else(num_cpus::get)
    }

    pub fn per_page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout)
    }

    /// The installed language packs, detecting them if not configured.
    pub async fn installed_languages(&self) -> Result<InstalledLanguages> {
        let installed = match &self.installed_languages {
            Some(languages) => InstalledLanguages::new(languages.iter().copied()),
            None => tesseract::installed_languages()
                .await
                .context("could not detect installed language packs")?,
        };
        if installed.is_empty() {
            warn!("No supported language packs are installed");
        }
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[clap(flatten)]
        opts: PipelineOpts,
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let opts = PipelineOpts::default();
        opts.validate()?;
        assert!(opts.max_concurrent_pages() > 0);
        assert_eq!(opts.per_page_timeout(), Duration::from_secs(120));
        Ok(())
    }

    #[test]
    fn parses_flags() -> Result<()> {
        let cli = TestCli::try_parse_from([
            "test",
            "--max-concurrent-pages",
            "3",
            "--installed-languages",
            "eng,fra",
            "--confidence-threshold",
            "0.8",
        ])?;
        cli.opts.validate()?;
        assert_eq!(cli.opts.max_concurrent_pages(), 3);
        assert_eq!(
            cli.opts.installed_languages,
            Some(vec![Language::English, Language::French])
        );
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            PipelineOpts {
                max_concurrent_pages: Some(0),
                ..PipelineOpts::default()
            },
            PipelineOpts {
                page_timeout: 0,
                ..PipelineOpts::default()
            },
            PipelineOpts {
                confidence_threshold: 1.5,
                ..PipelineOpts::default()
            },
        ];
        for opts in bad {
            assert!(opts.validate().is_err(), "{:?} should be invalid", opts);
        }
    }

    #[tokio::test]
    async fn configured_languages_skip_detection() -> Result<()> {
        let opts = PipelineOpts {
            installed_languages: Some(vec![Language::Arabic]),
            ..PipelineOpts::default()
        };
        let installed = opts.installed_languages().await?;
        assert!(installed.contains(Language::Arabic));
        assert!(!installed.contains(Language::English));
        Ok(())
    }
}
