//! Tree connection reference counting

use super::TestContext;
use crate::client::File;
use crate::error::Error;
use crate::session::FileMode;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_opens_share_one_tree() {
        let ctx = TestContext::new().await.unwrap();
        ctx.memory.add_share("media");

        let first = ctx.server.find_share("media").await.unwrap();
        let second = ctx.server.find_share("MEDIA").await.unwrap();
        assert_eq!(first.name(), "media");

        let (a, b) = tokio::join!(first.open(), second.open());
        a.unwrap();
        b.unwrap();
        assert!(first.is_open() && second.is_open());
        assert_eq!(ctx.calls_of("tree_connect").len(), 1);
        // `public` plus `media`
        assert_eq!(ctx.memory.live_trees(), 2);

        first.close().await;
        assert!(second.is_open());
        assert_eq!(ctx.memory.live_trees(), 2);
        assert!(second.list_files("/").await.unwrap().is_empty());

        second.close().await;
        assert!(!first.is_open());
        assert_eq!(ctx.memory.live_trees(), 1);
        assert_eq!(ctx.calls_of("tree_disconnect").len(), 1);

        // Extra closes are ignored
        second.close().await;
        assert_eq!(ctx.calls_of("tree_disconnect").len(), 1);
        assert!(matches!(first.status("/").await, Err(Error::NotOpen)));

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_descriptor_keeps_tree_alive() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", b"abc");

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();

        ctx.share.close().await;
        assert!(ctx.share.is_open());
        assert_eq!(ctx.memory.live_trees(), 1);
        assert_eq!(&file.read_to_end(None).await.unwrap()[..], b"abc");

        file.close().await;
        assert!(!ctx.share.is_open());
        assert_eq!(ctx.memory.live_trees(), 0);
        assert_eq!(ctx.memory.live_descriptors(), 0);

        // Nothing left to release
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_file_races_share_close() {
        let ctx = TestContext::new().await.unwrap();
        ctx.memory.add_share("media");
        let media = ctx.server.find_share("media").await.unwrap();

        let mut tasks = Vec::new();
        for task in 0..4 {
            let share = media.clone();
            tasks.push(tokio::spawn(async move {
                for step in 0..10 {
                    share.open().await.unwrap();
                    let mut file = File::new(&share, &format!("/t{}-{}.bin", task, step));
                    let opened = file.open(FileMode::WRITE).await;
                    share.close().await;
                    opened.unwrap();
                    tokio::task::yield_now().await;
                    file.close().await;
                }
            }));
        }
        let churn = media.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                churn.open().await.unwrap();
                tokio::task::yield_now().await;
                churn.close().await;
            }
        }));
        for task in tasks {
            task.await.unwrap();
        }

        // Every descriptor landed on a live tree and nothing leaked
        assert!(!media.is_open());
        assert_eq!(ctx.memory.live_descriptors(), 0);
        assert_eq!(ctx.memory.live_trees(), 1);
        assert_eq!(
            ctx.calls_of("tree_connect").len(),
            ctx.calls_of("tree_disconnect").len()
        );

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_open_releases_its_reference() {
        let ctx = TestContext::new().await.unwrap();

        let mut file = ctx.file("/missing.txt");
        assert!(file.open(FileMode::READ).await.is_err());

        ctx.share.close().await;
        assert!(!ctx.share.is_open());
        assert_eq!(ctx.memory.live_trees(), 0);

        let mut file = ctx.file("/missing.txt");
        assert!(matches!(file.open(FileMode::READ).await, Err(Error::NotOpen)));
    }

    #[tokio::test]
    async fn test_unknown_share() {
        let ctx = TestContext::new().await.unwrap();

        let error = ctx.server.find_share("nope").await.unwrap_err();
        assert!(error.is_not_found());
        assert!(!matches!(error, Error::NotConnected));

        ctx.shutdown().await;
    }
}
