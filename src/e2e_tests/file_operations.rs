//! Streaming reads and writes, seeking and open modes

use super::TestContext;
use crate::error::{Error, NtStatus};
use crate::session::FileMode;
use bytes::Bytes;

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_delivers_ceil_n_over_b_chunks() {
        let ctx = TestContext::new().await.unwrap();
        let data = pattern(1000);
        ctx.put("/data.bin", &data);

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        assert_eq!(file.stat().unwrap().size, 1000);

        let mut chunks = Vec::new();
        let mut finals = Vec::new();
        let total = file
            .read(128, None, |step| {
                match step.data {
                    Some(chunk) => chunks.push(chunk.to_vec()),
                    None => finals.push((step.total, step.complete, step.error.is_some())),
                }
                true
            })
            .await
            .unwrap();

        assert_eq!(total, 1000);
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 128));
        assert_eq!(chunks.concat(), data);
        assert_eq!(finals, vec![(1000, true, false)]);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_exact_multiple_of_buffer() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", &pattern(1024));

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();

        let mut sizes = Vec::new();
        file.read(256, None, |step| {
            if let Some(chunk) = step.data {
                sizes.push(chunk.len());
            }
            true
        })
        .await
        .unwrap();
        assert_eq!(sizes, vec![256; 4]);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_stops_when_progress_declines() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", &pattern(1000));

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        ctx.memory.clear_calls();

        let mut records = Vec::new();
        let total = file
            .read(100, None, |step| {
                records.push((step.total, step.data.map(<[u8]>::len), step.complete));
                step.total < 200
            })
            .await
            .unwrap();

        assert_eq!(total, 200);
        assert_eq!(
            records,
            vec![(100, Some(100), false), (200, Some(100), false), (200, None, true)]
        );
        // Chunk three is never requested
        assert_eq!(ctx.calls_of("read").len(), 2);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_honours_max_bytes() {
        let ctx = TestContext::new().await.unwrap();
        let data = pattern(1000);
        ctx.put("/data.bin", &data);

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();

        let mut sizes = Vec::new();
        let total = file
            .read(300, Some(700), |step| {
                if let Some(chunk) = step.data {
                    sizes.push(chunk.len());
                }
                true
            })
            .await
            .unwrap();
        assert_eq!(total, 700);
        assert_eq!(sizes, vec![300, 300, 100]);

        file.seek(0, true).await.unwrap();
        let head = file.read_to_end(Some(10)).await.unwrap();
        assert_eq!(&head[..], &data[..10]);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_error_arrives_on_final_progress() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", &pattern(500));

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        ctx.memory.fail_after("read", 1, NtStatus::UNSUCCESSFUL);

        let mut records = Vec::new();
        let result = file
            .read(100, None, |step| {
                records.push((step.total, step.data.is_some(), step.complete, step.error.is_some()));
                true
            })
            .await;

        assert!(matches!(result, Err(Error::ReadFailed(NtStatus::UNSUCCESSFUL))));
        assert_eq!(records, vec![(100, true, false, false), (100, false, true, true)]);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_buffer_is_rejected() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", b"abc");

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        ctx.memory.clear_calls();

        let mut completes = 0;
        let result = file
            .read(0, None, |step| {
                completes += usize::from(step.complete);
                true
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
        assert_eq!(completes, 1);
        assert!(ctx.calls_of("read").is_empty());

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_pulls_until_producer_is_empty() {
        let ctx = TestContext::new().await.unwrap();

        let mut file = ctx.file("/out.bin");
        file.open(FileMode::WRITE).await.unwrap();

        let mut chunks = vec![
            Bytes::from(vec![1u8; 10]),
            Bytes::from(vec![2u8; 20]),
            Bytes::from(vec![3u8; 5]),
        ]
        .into_iter();
        let mut offsets = Vec::new();
        let mut records = Vec::new();
        let total = file
            .write(
                |written| {
                    offsets.push(written);
                    chunks.next()
                },
                |step| records.push((step.total, step.last, step.complete, step.error.is_some())),
            )
            .await
            .unwrap();

        assert_eq!(total, 35);
        assert_eq!(offsets, vec![0, 10, 30, 35]);
        assert_eq!(
            records,
            vec![
                (10, 10, false, false),
                (30, 20, false, false),
                (35, 5, false, false),
                (35, 5, true, false),
            ]
        );
        file.close().await;

        let mut expected = vec![1u8; 10];
        expected.extend([2u8; 20]);
        expected.extend([3u8; 5]);
        assert_eq!(ctx.memory.file_contents("public", "/out.bin").unwrap(), expected);
        assert_eq!(file.stat().unwrap().size, 35);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_error_arrives_on_final_progress() {
        let ctx = TestContext::new().await.unwrap();

        let mut file = ctx.file("/out.bin");
        file.open(FileMode::WRITE).await.unwrap();
        ctx.memory.fail_after("write", 1, NtStatus::ACCESS_DENIED);

        let mut records = Vec::new();
        let result = file
            .write(
                |_| Some(Bytes::from_static(b"chunk")),
                |step| records.push((step.total, step.complete, step.error.is_some())),
            )
            .await;

        assert!(matches!(result, Err(Error::WriteFailed(NtStatus::ACCESS_DENIED))));
        assert_eq!(records, vec![(5, false, false), (5, true, true)]);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_all_and_read_back() {
        let ctx = TestContext::new().await.unwrap();
        let data = Bytes::from(pattern(200_000));

        let mut file = ctx.file("/big.bin");
        file.open(FileMode::READ_WRITE).await.unwrap();
        assert_eq!(file.write_all(data.clone()).await.unwrap(), 200_000);
        assert_eq!(ctx.calls_of("write").len(), 4);

        assert_eq!(file.seek(0, true).await.unwrap(), 0);
        assert_eq!(file.read_to_end(None).await.unwrap(), data);

        assert_eq!(file.seek(-100, false).await.unwrap(), 199_900);
        assert_eq!(file.read_to_end(None).await.unwrap().len(), 100);
        assert!(matches!(
            file.seek(-1, true).await,
            Err(Error::SeekFailed(NtStatus::INVALID_PARAMETER))
        ));

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_modes() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/docs/existing.txt", b"keep me");

        let mut missing = ctx.file("/docs/missing.txt");
        assert!(matches!(
            missing.open(FileMode::READ).await,
            Err(Error::NoSuchFileOrDirectory(_))
        ));
        assert!(!missing.is_open());

        let mut dir = ctx.file("/docs");
        assert!(matches!(
            dir.open(FileMode::READ).await,
            Err(Error::Protocol {
                status: NtStatus::FILE_IS_A_DIRECTORY,
                ..
            })
        ));

        // Writing does not truncate
        let mut existing = ctx.file("/docs/existing.txt");
        existing.open(FileMode::WRITE).await.unwrap();
        existing.write_all(Bytes::from_static(b"KEEP")).await.unwrap();
        assert!(matches!(
            existing.read_to_end(None).await,
            Err(Error::ReadFailed(NtStatus::ACCESS_DENIED))
        ));

        // Reopening in another mode replaces the descriptor
        existing.open(FileMode::READ).await.unwrap();
        assert_eq!(existing.descriptor().unwrap().mode(), FileMode::READ);
        assert_eq!(&existing.read_to_end(None).await.unwrap()[..], b"KEEP me");
        existing.open(FileMode::READ).await.unwrap();
        assert_eq!(ctx.calls_of("open").len(), 4);

        existing.close().await;
        existing.close().await;
        assert_eq!(ctx.memory.live_descriptors(), 0);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_open_file_closes_descriptor() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", b"abc");

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        assert_eq!(ctx.memory.live_descriptors(), 1);
        drop(file);

        for _ in 0..100 {
            if ctx.memory.live_descriptors() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.memory.live_descriptors(), 0);

        ctx.shutdown().await;
    }
}
