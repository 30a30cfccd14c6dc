//! Recognition via the `tesseract` CLI tool.

use std::{io::Cursor, process::Stdio};

use image::ImageFormat;
use tokio::{io::AsyncWriteExt as _, process::Command};

use super::{Recognition, Recognizer};
use crate::{
    async_utils::{blocking::spawn_blocking_propagating_panics, check_for_command_failure},
    errors::RecognitionError,
    language::{InstalledLanguages, Language},
    model::PageImage,
    prelude::*,
};

/// Recognizer wrapping the `tesseract` CLI tool.
///
/// Pages are piped through standard input and the `tsv` output is parsed, so
/// we get per-word confidences without touching the filesystem.
#[derive(Clone, Debug)]
pub struct TesseractRecognizer {
    /// Convert pages to grayscale before recognition.
    grayscale: bool,
}

impl TesseractRecognizer {
    pub fn new(grayscale: bool) -> Self {
        Self { grayscale }
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    #[instrument(level = "debug", skip_all, fields(language = %language))]
    async fn recognize(
        &self,
        image: &PageImage,
        language: Language,
    ) -> Result<Recognition, RecognitionError> {
        let input = if self.grayscale {
            let data = image.data.clone();
            spawn_blocking_propagating_panics(move || to_grayscale_png(&data)).await?
        } else {
            image.data.clone()
        };

        // `kill_on_drop` matters: if this future is abandoned because of a
        // timeout or cancellation, the process must not outlive it.
        let mut child = Command::new("tesseract")
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(language.code())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognitionError::Engine("tesseract has no stdin".to_owned()))?;
        stdin.write_all(&input).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        check_for_command_failure("tesseract", &output, None)
            .map_err(|err| RecognitionError::Engine(format!("{:#}", err)))?;
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Ask `tesseract` which language packs are installed.
pub async fn installed_languages() -> Result<InstalledLanguages> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .await
        .context("cannot run tesseract")?;
    check_for_command_failure("tesseract", &output, None)?;
    // Old versions print the list to stderr.
    let mut listing = String::from_utf8_lossy(&output.stdout).into_owned();
    listing.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(InstalledLanguages::from_list_langs_output(&listing))
}

/// Decode any supported image and re-encode it as an 8-bit grayscale PNG.
fn to_grayscale_png(data: &[u8]) -> Result<Vec<u8>, RecognitionError> {
    let image =
        image::load_from_memory(data).map_err(|err| RecognitionError::Image(err.to_string()))?;
    let gray = image.into_luma8();
    let mut png = Vec::new();
    gray.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| RecognitionError::Image(err.to_string()))?;
    Ok(png)
}

/// Word-level TSV columns we care about.
const TSV_LEVEL: usize = 0;
const TSV_BLOCK: usize = 2;
const TSV_PAR: usize = 3;
const TSV_LINE: usize = 4;
const TSV_CONF: usize = 10;
const TSV_TEXT: usize = 11;

/// Word rows have level 5.
const WORD_LEVEL: &str = "5";

/// Rebuild text and mean word confidence from `tesseract ... tsv` output.
///
/// Words on the same line are joined with spaces. Lines are separated by a
/// newline, and paragraphs or blocks by a blank line. A page with no words
/// has empty text and a confidence of 0.0.
fn parse_tsv(tsv: &str) -> Recognition {
    let mut text = String::new();
    let mut current_line: Option<(&str, &str, &str)> = None;
    let mut confidence_sum = 0.0f32;
    let mut word_count = 0usize;

    // Skip the header row.
    for row in tsv.lines().skip(1) {
        let columns = row.split('\t').collect::<Vec<_>>();
        if columns.len() <= TSV_TEXT || columns[TSV_LEVEL] != WORD_LEVEL {
            continue;
        }
        let word = columns[TSV_TEXT].trim();
        let conf = columns[TSV_CONF].parse::<f32>().unwrap_or(-1.0);
        if word.is_empty() || !conf.is_finite() || conf < 0.0 {
            continue;
        }

        let line = (columns[TSV_BLOCK], columns[TSV_PAR], columns[TSV_LINE]);
        match current_line {
            Some(prev) if prev == line => text.push(' '),
            Some(prev) if (prev.0, prev.1) == (line.0, line.1) => text.push('\n'),
            Some(_) => text.push_str("\n\n"),
            None => {}
        }
        current_line = Some(line);
        text.push_str(word);

        confidence_sum += conf;
        word_count += 1;
    }

    let confidence = if word_count == 0 {
        0.0
    } else {
        (confidence_sum / word_count as f32 / 100.0).clamp(0.0, 1.0)
    };
    Recognition { text, confidence }
}
