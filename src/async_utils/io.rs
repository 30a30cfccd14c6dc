//! Output utilities.
//!
//! Results are written as JSONL, either to a file or to standard output.

use futures::{pin_mut, stream::StreamExt as _};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

use super::BoxedStream;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of serializable records to either standard output or a
/// file, one JSON object per line.
pub async fn write_jsonl<T>(path: Option<&Path>, stream: BoxedStream<Result<T>>) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(record) = stream.next().await {
        let record = record?;
        let json =
            serde_json::to_string(&record).context("Failed to serialize output record")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
        // Flush per record, so partial output survives an interrupted run.
        writer.flush().await.context("Failed to flush output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn writes_one_line_per_record() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("io-test")?;
        let path = dir.path().join("out.jsonl");
        let records = stream::iter(vec![Ok(serde_json::json!({"a": 1})), Ok(serde_json::json!({"a": 2}))]).boxed();
        write_jsonl(Some(&path), records).await?;
        let written = tokio::fs::read_to_string(&path).await?;
        assert_eq!(written, "{\"a\":1}\n{\"a\":2}\n");
        Ok(())
    }
}
