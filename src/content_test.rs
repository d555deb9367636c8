use anyhow::{Context, Result};
use rstest::rstest;

use crate::content::{hash_bytes, AssetContent, SourceContent, MAX_BUFFERED_SIZE};

/// Deterministic pseudo-random content of a given size.
fn content_of_size(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn ok_small_file_is_buffered() -> Result<()> {
    // Assemble.
    let tmpdir = tempfile::tempdir().context("error building tempdir for test")?;
    let path = tmpdir.path().join("small.txt");
    let bytes = b"hello lade".to_vec();
    tokio::fs::write(&path, &bytes)
        .await
        .context("error writing test file")?;

    // Action.
    let source = SourceContent::from_file(&path).await?;

    // Assert.
    anyhow::ensure!(
        matches!(source.content, AssetContent::Buffer(_)),
        "small files must stay in memory"
    );
    anyhow::ensure!(source.size == bytes.len() as u64);
    anyhow::ensure!(
        source.hash == hash_bytes(&bytes),
        "streamed hash must equal the direct hash over the same bytes"
    );
    Ok(())
}

#[tokio::test]
async fn ok_oversized_file_becomes_stream() -> Result<()> {
    // Assemble: 7 MiB, well past the buffering threshold.
    let tmpdir = tempfile::tempdir().context("error building tempdir for test")?;
    let path = tmpdir.path().join("big.bin");
    let bytes = content_of_size(7 * 1024 * 1024);
    tokio::fs::write(&path, &bytes)
        .await
        .context("error writing test file")?;

    // Action.
    let source = SourceContent::from_file(&path).await?;

    // Assert.
    anyhow::ensure!(
        matches!(source.content, AssetContent::Stream(_)),
        "oversized files must not be buffered"
    );
    anyhow::ensure!(source.size == bytes.len() as u64);
    anyhow::ensure!(source.hash == hash_bytes(&bytes));
    let materialized = source.content.to_bytes().await?;
    anyhow::ensure!(
        materialized.len() == bytes.len() && materialized[..] == bytes[..],
        "re-opened stream must yield the full content"
    );
    Ok(())
}

#[rstest]
#[case::below_threshold(1024)]
#[case::at_threshold(MAX_BUFFERED_SIZE)]
#[case::above_threshold(MAX_BUFFERED_SIZE + 1)]
#[tokio::test]
async fn ok_hash_stable_across_size_boundary(#[case] size: u64) -> Result<()> {
    // Assemble.
    let tmpdir = tempfile::tempdir().context("error building tempdir for test")?;
    let path = tmpdir.path().join("file.bin");
    let bytes = content_of_size(size);
    tokio::fs::write(&path, &bytes)
        .await
        .context("error writing test file")?;

    // Action.
    let source = SourceContent::from_file(&path).await?;

    // Assert: the hash does not depend on which side of the buffering
    // threshold the file lands on.
    anyhow::ensure!(source.hash == hash_bytes(&bytes));
    anyhow::ensure!(source.size == size);
    Ok(())
}

#[tokio::test]
async fn ok_inline_code_is_hashed_over_exact_bytes() -> Result<()> {
    // Action.
    let source = SourceContent::from_inline("let x = 1;");

    // Assert.
    anyhow::ensure!(source.size == 10);
    anyhow::ensure!(source.hash == hash_bytes(b"let x = 1;"));
    anyhow::ensure!(matches!(source.content, AssetContent::Buffer(_)));
    Ok(())
}

#[tokio::test]
async fn err_missing_file() -> Result<()> {
    // Action.
    let res = SourceContent::from_file(std::path::Path::new("/definitely/not/here.txt")).await;

    // Assert.
    anyhow::ensure!(
        matches!(res, Err(crate::error::EngineError::ContentRead { .. })),
        "unreadable sources must surface as a content read error"
    );
    Ok(())
}
