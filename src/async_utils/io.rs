//! I/O utilities.
//!
//! Request files may be JSON or TOML, chosen by file extension. Output goes to
//! a file or to standard output.

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::{payload::ImagePayload, prelude::*};

/// Read TOML or JSON from a file. Files ending in `.json` are JSON, and
/// everything else is TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    // Read all at once because our parsing libraries don't do async I/O.
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))
    } else {
        toml::from_str(&data)
            .with_context(|| format!("Failed to parse TOML from file at path: {:?}", path))
    }
}

/// Load image files, in order.
pub async fn read_images(paths: &[PathBuf]) -> Result<Vec<ImagePayload>> {
    try_join_all(paths.iter().map(|path| ImagePayload::from_path(path))).await
}

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

/// Write text to either standard output or a file, ending with a newline.
pub async fn write_text_output(path: Option<&Path>, text: &str) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    writer
        .write_all(text.as_bytes())
        .await
        .context("Failed to write output")?;
    if !text.ends_with('\n') {
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write a value as pretty-printed JSON to either standard output or a file.
pub async fn write_json_output<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    write_text_output(path, &json).await
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        marks: i64,
    }

    #[tokio::test]
    async fn test_read_json_or_toml() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(toml_file, "marks = 20").unwrap();
        let sample: Sample = read_json_or_toml(toml_file.path()).await.unwrap();
        assert_eq!(sample, Sample { marks: 20 });

        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(json_file, r#"{{"marks": 30}}"#).unwrap();
        let sample: Sample = read_json_or_toml(json_file.path()).await.unwrap();
        assert_eq!(sample, Sample { marks: 30 });
    }

    #[tokio::test]
    async fn test_write_text_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paper.txt");
        write_text_output(Some(&path), "Q1. Why?").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Q1. Why?\n");
    }
}
