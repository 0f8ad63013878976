//! Serialization and teardown of the shared session

use super::TestContext;
use crate::error::Error;
use crate::session::FileMode;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let ctx = TestContext::new().await.unwrap();
        ctx.memory.set_call_delay(Duration::from_millis(1));

        let mut tasks = Vec::new();
        for task in 0..4 {
            let share = ctx.share.clone();
            tasks.push(tokio::spawn(async move {
                for step in 0..5 {
                    share
                        .status(&format!("/task{}/step{}", task, step))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let calls = ctx.calls_of("stat");
        assert_eq!(calls.len(), 20);
        assert_eq!(ctx.memory.overlapping_calls(), 0);

        // Each caller's calls reach the session in the order it made them
        for task in 0..4 {
            let own: Vec<_> = calls
                .iter()
                .filter(|call| call.starts_with(&format!("stat \\task{}\\", task)))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..5)
                .map(|step| format!("stat \\task{}\\step{}", task, step))
                .collect();
            assert_eq!(own, expected);
        }

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_shares_and_files() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", &[7u8; 64]);

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        ctx.server.disconnect().await;
        assert!(!ctx.server.is_connected());
        assert!(!ctx.share.is_open());

        assert!(matches!(
            file.read(16, None, |_| true).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(file.seek(0, true).await, Err(Error::NotConnected)));
        assert!(matches!(ctx.share.status("/data.bin").await, Err(Error::NotConnected)));
        assert!(matches!(ctx.share.list_files("/").await, Err(Error::NotConnected)));
        assert!(matches!(
            ctx.share.delete_file("/data.bin").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(ctx.server.list_shares().await, Err(Error::NotConnected)));

        // Closing after disconnect still resets local state
        file.close().await;
        assert!(!file.is_open());
        ctx.share.close().await;

        assert_eq!(ctx.memory.disconnects(), 1);
        assert_eq!(ctx.memory.calls_after_disconnect(), 0);
        assert!(ctx.memory.exists("public", "/data.bin"));
    }

    #[tokio::test]
    async fn test_disconnect_releases_open_handles_first() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", b"abc");

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        let fd = file.descriptor().unwrap().fd();
        ctx.memory.clear_calls();

        ctx.server.disconnect().await;

        let calls = ctx.memory.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], format!("close {}", fd));
        assert!(calls[1].starts_with("tree_disconnect tid:"));
        assert_eq!(calls[2], "disconnect");
        assert_eq!(ctx.memory.live_descriptors(), 0);
        assert_eq!(ctx.memory.live_trees(), 0);

        // Nothing is left for the client to close
        file.close().await;
        ctx.share.close().await;
        assert_eq!(ctx.memory.calls_after_disconnect(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_session_handles() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", b"abc");

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();
        ctx.server.connect(None, None).await.unwrap();

        assert_eq!(ctx.memory.live_descriptors(), 0);
        assert_eq!(ctx.memory.live_trees(), 0);
        assert_eq!(ctx.memory.disconnects(), 1);

        file.close().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_work_fails_fast_on_disconnect() {
        let ctx = TestContext::new().await.unwrap();
        ctx.memory.set_call_delay(Duration::from_millis(5));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let share = ctx.share.clone();
            tasks.push(tokio::spawn(async move {
                share.create_directory(&format!("/dir{}", i)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(8)).await;
        ctx.server.disconnect().await;

        let mut failed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => {}
                Err(Error::NotConnected) => failed += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(failed > 0);
        assert_eq!(ctx.memory.calls_after_disconnect(), 0);
    }

    #[tokio::test]
    async fn test_descriptors_do_not_survive_reconnect() {
        let ctx = TestContext::new().await.unwrap();
        ctx.put("/data.bin", b"payload");

        let mut file = ctx.file("/data.bin");
        file.open(FileMode::READ).await.unwrap();

        ctx.server.connect(None, None).await.unwrap();
        assert!(ctx.server.is_connected());
        assert!(!ctx.share.is_open());

        // Old descriptor belongs to the previous session
        assert!(matches!(
            file.read_to_end(None).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(ctx.share.list_files("/").await, Err(Error::NotOpen)));

        ctx.share.open().await.unwrap();
        let files = ctx.share.list_files("/").await.unwrap();
        assert_eq!(files.len(), 1);

        file.close().await;
        file.open(FileMode::READ).await.unwrap();
        assert_eq!(&file.read_to_end(None).await.unwrap()[..], b"payload");
        file.close().await;

        assert_eq!(ctx.memory.calls_after_disconnect(), 0);
        ctx.shutdown().await;
    }
}
