//! PDF rasterization using Poppler's `pdfinfo` and `pdftocairo`, plus the
//! embedded text layer from `pdftotext`.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::{fs, process::Command};

use crate::{
    async_utils::check_for_command_failure, cpu_limit::CpuLimit,
    errors::RasterizationError, model::PageImage, prelude::*,
};

/// Poppler reports problems on stderr even when it exits successfully.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Errors Poppler recovers from on its own.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Render every page of a PDF to PNG, using `scratch` for intermediate files.
///
/// If `read_text_layer` is set, each page also carries whatever text the PDF
/// already contains for it. Failing to read that text is not an error, since
/// the pages can still be OCRed.
#[instrument(level = "debug", skip_all, fields(dpi))]
pub(super) async fn rasterize_pdf(
    content: &[u8],
    scratch: &Path,
    dpi: u32,
    read_text_layer: bool,
    cpu_limit: &CpuLimit,
) -> Result<Vec<PageImage>, RasterizationError> {
    let input_path = scratch.join("input.pdf");
    fs::write(&input_path, content).await?;

    let total_pages = get_pdf_page_count(&input_path).await?;
    if total_pages == 0 {
        return Err(RasterizationError::NoPages);
    }

    // pdftocairo appends zero-padded page numbers to this prefix, so the
    // output files sort in page order.
    let pages_dir = scratch.join("pages");
    fs::create_dir(&pages_dir).await?;
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg(&input_path)
        .arg(pages_dir.join("page"))
        .kill_on_drop(true);

    // pdftocairo will use _at least_ 100% of a CPU, and we don't want to run
    // 200 copies of it at once by mistake.
    let output = cpu_limit
        .run(|| async { cmd.output().await.context("failed to run pdftocairo") })
        .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
        .map_err(|err| RasterizationError::Decode(format!("{:#}", err)))?;

    let mut page_paths = vec![];
    let mut entries = fs::read_dir(&pages_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        page_paths.push(entry.path());
    }
    page_paths.sort();
    if page_paths.len() != total_pages {
        return Err(RasterizationError::Decode(format!(
            "expected {} pages from pdftocairo, found {}",
            total_pages,
            page_paths.len()
        )));
    }

    let mut pages = Vec::with_capacity(total_pages);
    for path in page_paths {
        let data = fs::read(&path).await?;
        // Delete the file to recover space a bit early.
        fs::remove_file(&path).await?;
        pages.push(PageImage::new("image/png", data));
    }

    if read_text_layer {
        match extract_text_layer(&input_path, total_pages, cpu_limit).await {
            Ok(texts) => {
                for (page, text) in pages.iter_mut().zip(texts) {
                    page.text_layer = Some(text);
                }
            }
            Err(err) => warn!("Could not read PDF text layer, will OCR every page: {:#}", err),
        }
    }
    Ok(pages)
}

/// Get the embedded text of each page with `pdftotext`.
#[instrument(level = "debug", skip_all)]
async fn extract_text_layer(
    path: &Path,
    total_pages: usize,
    cpu_limit: &CpuLimit,
) -> Result<Vec<String>> {
    let mut cmd = Command::new("pdftotext");
    cmd.arg("-layout")
        .arg("-enc")
        .arg("UTF-8")
        .arg(path)
        .arg("-")
        .kill_on_drop(true);
    let output = cpu_limit
        .run(|| async { cmd.output().await.context("cannot run pdftotext") })
        .await?;
    check_for_command_failure("pdftotext", &output, Some(&is_error_line))?;
    split_text_layer(&String::from_utf8_lossy(&output.stdout), total_pages)
}

/// Split `pdftotext` output into pages. Each page ends with a form feed.
fn split_text_layer(text: &str, total_pages: usize) -> Result<Vec<String>> {
    let text = text.strip_suffix('\x0C').unwrap_or(text);
    let pages = text.split('\x0C').map(str::to_owned).collect::<Vec<_>>();
    if pages.len() != total_pages {
        return Err(anyhow!(
            "expected {} pages of text from pdftotext, found {}",
            total_pages,
            pages.len()
        ));
    }
    Ok(pages)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
async fn get_pdf_page_count(path: &Path) -> Result<usize, RasterizationError> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await?;
    // Password-protected and corrupt files end up here.
    check_for_command_failure("pdfinfo", &output, None)
        .map_err(|err| RasterizationError::Decode(format!("{:#}", err)))?;

    let output = String::from_utf8_lossy(&output.stdout);
    parse_page_count(&output)
}

/// Find `Pages:` in `pdfinfo` output.
fn parse_page_count(output: &str) -> Result<usize, RasterizationError> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties.get("Pages").ok_or_else(|| {
        RasterizationError::Decode("failed to find page count in pdfinfo output".to_owned())
    })?;
    pages.parse::<usize>().map_err(|err| {
        RasterizationError::Decode(format!("bad page count {:?}: {}", pages, err))
    })
}
