//! Full client stack over the local directory backend

use crate::client::{File, FileServer};
use crate::session::local::DirectoryConnector;
use crate::session::FileMode;
use bytes::Bytes;
use tempfile::TempDir;

/// Server exporting `dir` as `public`, already connected as guest
async fn connected(dir: &TempDir) -> FileServer {
    let connector = DirectoryConnector::new().add_share("public", dir.path());
    let server = FileServer::new("127.0.0.1", "LOCAL", None, connector);
    assert!(server.connect(None, None).await.unwrap());
    server
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;

    #[tokio::test]
    async fn test_upload_and_download() {
        let dir = TempDir::new().unwrap();
        let server = connected(&dir).await;

        let names: Vec<_> = server
            .list_shares()
            .await
            .unwrap()
            .iter()
            .map(|share| share.name().to_string())
            .collect();
        assert_eq!(names, vec!["public"]);

        let share = server.find_share("public").await.unwrap();
        share.open().await.unwrap();

        let mut docs = File::new(&share, "/docs/2024");
        docs.create_directories().await.unwrap();
        assert!(dir.path().join("docs/2024").is_dir());

        let payload = Bytes::from((0..100_000u32).map(|i| i as u8).collect::<Vec<_>>());
        let mut upload = File::relative_to(&docs, "report.bin");
        upload.open(FileMode::WRITE).await.unwrap();
        assert_eq!(upload.write_all(payload.clone()).await.unwrap(), 100_000);
        upload.close().await;
        assert_eq!(upload.stat().unwrap().size, 100_000);

        let on_disk = fs::read(dir.path().join("docs/2024/report.bin")).await.unwrap();
        assert_eq!(on_disk, payload);

        let mut download = File::new(&share, "\\docs\\2024\\report.bin");
        download.open(FileMode::READ).await.unwrap();
        assert_eq!(download.read_to_end(None).await.unwrap(), payload);
        download.close().await;

        share.close().await;
        server.disconnect().await;
    }

    #[tokio::test]
    async fn test_listing_moving_and_deleting() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("inbox")).await.unwrap();
        fs::write(dir.path().join("inbox/a.txt"), b"alpha").await.unwrap();
        fs::write(dir.path().join("inbox/b.txt"), b"bravo!").await.unwrap();

        let server = connected(&dir).await;
        let share = server.find_share("PUBLIC").await.unwrap();
        share.open().await.unwrap();

        let inbox = File::new(&share, "/inbox");
        let files = inbox.list_files().await.unwrap();
        let listing: Vec<_> = files
            .iter()
            .map(|file| (file.name().to_string(), file.stat().unwrap().size))
            .collect();
        assert_eq!(
            listing,
            vec![("a.txt".to_string(), 5), ("b.txt".to_string(), 6)]
        );

        let mut a = File::new(&share, "/inbox/a.txt");
        let moved = a.move_to("../a.txt").await.unwrap();
        assert_eq!(moved.path(), "/a.txt");
        assert!(dir.path().join("a.txt").is_file());

        let mut inbox = inbox;
        assert!(inbox.delete().await.is_err());
        share.delete_file("/inbox/b.txt").await.unwrap();
        inbox.delete().await.unwrap();
        assert!(!dir.path().join("inbox").exists());
        assert!(!share.status("/inbox").await.unwrap().exists);

        share.close().await;
        server.disconnect().await;
    }
}
